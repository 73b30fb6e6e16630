//! Archive analysis and source-target matching
//!
//! Both tar streams are walked once to fingerprint every usable regular
//! file (SHA-1 plus a content-defined chunk table). The matcher then pairs
//! each new-tar file with at most one old-tar file, and the payloads of all
//! old files chosen for delta generation are concatenated into a temporary
//! scratch file for random access while the delta is produced.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use tar::{Archive, EntryType};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::compression::auto_decompress;
use crate::error::{DeltaError, Result};
use crate::rollsum::{compute_chunk_matches, Chunk, ChunkMatches, RollingChunker};

/// Files below this size always count as similar in size
const SMALL_FILE_LIMIT: u64 = 64 * 1024;

/// One usable regular file found in a tar stream
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Position in the tar, counting every header
    pub index: usize,
    /// Normalized path, relative, no `.`/`..`/empty segments
    pub path: String,
    pub basename: String,
    pub size: u64,
    /// Hex SHA-1 of the file contents
    pub sha1: String,
    pub chunks: Vec<Chunk>,
    /// A later entry in the same tar uses this path
    pub overwritten: bool,
}

/// All usable files of one tar, in tar order
#[derive(Debug)]
pub struct TarInfo {
    pub files: Vec<FileInfo>,
}

/// An old-tar file considered as delta source
#[derive(Debug)]
pub struct SourceInfo {
    /// Index into the old file list
    pub file: usize,
    /// Some target uses this source for bsdiff or chunk reuse
    pub used_for_delta: bool,
    /// Byte position of this file's payload inside the scratch file
    pub offset: u64,
}

/// A new-tar file together with its chosen source, if any
#[derive(Debug, Clone)]
pub struct TargetInfo {
    /// Index into the new file list
    pub file: usize,
    /// Index into the source list
    pub source: Option<usize>,
    pub matches: Option<ChunkMatches>,
}

/// Everything the delta generator needs about one old/new archive pair.
///
/// Owns the scratch file; dropping the analysis removes it.
pub struct DeltaAnalysis {
    old_files: Vec<FileInfo>,
    new_files: Vec<FileInfo>,
    sources: Vec<SourceInfo>,
    targets: Vec<TargetInfo>,
    target_by_index: HashMap<usize, usize>,
    scratch: NamedTempFile,
}

impl DeltaAnalysis {
    /// Look up the target info for a tar-sequence index in the new archive
    pub fn target_for_index(&self, index: usize) -> Option<&TargetInfo> {
        self.target_by_index.get(&index).map(|&i| &self.targets[i])
    }

    pub fn new_file(&self, target_file: usize) -> &FileInfo {
        &self.new_files[target_file]
    }

    /// The old-tar file record behind a source
    pub fn source_file(&self, source: usize) -> &FileInfo {
        &self.old_files[self.sources[source].file]
    }

    /// Read part of a source file's payload back from the scratch file
    pub fn read_source_data(&mut self, source: usize, offset: u64, size: usize) -> Result<Vec<u8>> {
        let base = self.sources[source].offset;
        let file = self.scratch.as_file_mut();
        file.seek(SeekFrom::Start(base + offset))?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Normalize a tar entry path as if rooted at `/`, then strip the root.
///
/// `.` and empty segments vanish, `..` pops (it cannot climb above the
/// root). Returns `None` when nothing is left.
pub fn clean_path(name: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(segment),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Sparse entries yield content that differs from the raw tar stream, so
/// they are never used for delta.
fn is_sparse<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<bool> {
    if entry.header().entry_type() == EntryType::GNUSparse {
        return Ok(true);
    }
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            if let Ok(key) = extension.key() {
                if matches!(
                    key,
                    "GNU.sparse.major" | "GNU.sparse.minor" | "GNU.sparse.map"
                ) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn chunk_invariant_error(path: &str, detail: String) -> DeltaError {
    DeltaError::InvalidChunks {
        path: path.to_string(),
        detail,
    }
}

fn verify_chunks(path: &str, chunks: &[Chunk], size: u64) -> Result<()> {
    let mut expected_offset = 0u64;
    for chunk in chunks {
        if chunk.offset != expected_offset {
            return Err(chunk_invariant_error(
                path,
                format!("offset {} does not follow {}", chunk.offset, expected_offset),
            ));
        }
        expected_offset += chunk.size;
    }
    if expected_offset != size {
        return Err(chunk_invariant_error(
            path,
            format!("chunk sizes sum to {expected_offset}, file size is {size}"),
        ));
    }
    Ok(())
}

/// Walk a (possibly compressed) tar stream and fingerprint every usable file
pub fn analyze_tar<R: Read>(reader: R) -> Result<TarInfo> {
    use sha1::{Digest, Sha1};

    let stream = auto_decompress(reader)?;
    let mut archive = Archive::new(stream);

    let mut files: Vec<FileInfo> = Vec::new();
    let mut kept_by_path: HashMap<String, usize> = HashMap::new();

    for (index, entry) in archive.entries()?.enumerate() {
        let mut entry = entry?;
        let raw_path = entry.path()?.to_string_lossy().into_owned();
        let cleaned = clean_path(&raw_path);

        // A later entry reusing the path shadows the earlier file, even when
        // the later entry itself is not usable.
        if let Some(path) = &cleaned {
            if let Some(&earlier) = kept_by_path.get(path) {
                files[earlier].overwritten = true;
            }
        }

        let Some(path) = cleaned else { continue };
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let size = entry.header().size()?;
        if size == 0 {
            continue;
        }
        if is_sparse(&mut entry)? {
            continue;
        }
        // Skip files the applier may not be able to read back, e.g. /etc/shadow
        if entry.header().mode()? & 0o004 == 0 {
            continue;
        }

        let mut hasher = Sha1::new();
        let mut chunker = RollingChunker::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            chunker.update(&buf[..n]);
        }
        let chunks = chunker.finish();
        verify_chunks(&path, &chunks, size)?;

        kept_by_path.insert(path.clone(), files.len());
        files.push(FileInfo {
            index,
            basename: basename(&path).to_string(),
            path,
            size,
            sha1: hex::encode(hasher.finalize()),
            chunks,
            overwritten: false,
        });
    }

    debug!("analyzed tar: {} usable files", files.len());
    Ok(TarInfo { files })
}

/// Compressed payloads gain nothing from bsdiff or chunk matching.
///
/// `.gz` is deliberately absent: gzip `--rsyncable` output can still delta.
fn is_delta_candidate(file: &FileInfo) -> bool {
    !(file.basename.starts_with(".xz") || file.basename.starts_with(".bz2"))
}

fn name_is_similar(a: &FileInfo, b: &FileInfo, fuzzy: u32) -> bool {
    if fuzzy == 0 {
        a.basename == b.basename
    } else {
        name_prefix(&a.basename) == name_prefix(&b.basename)
    }
}

/// The basename up to and including the first dot
fn name_prefix(name: &str) -> &str {
    match name.find('.') {
        Some(i) => &name[..=i],
        None => name,
    }
}

/// Wildly dissimilar sizes mean a different kind of file altogether, for
/// example a binary replaced by a shell wrapper.
fn size_is_similar(a: &FileInfo, b: &FileInfo) -> bool {
    if a.size < SMALL_FILE_LIMIT && b.size < SMALL_FILE_LIMIT {
        return true;
    }
    a.size < 10 * b.size && b.size < 10 * a.size
}

/// Copy the payload of every source used for delta into the scratch file,
/// recording each one's offset.
fn extract_delta_data<R: Read>(
    old_reader: R,
    source_by_index: &HashMap<usize, usize>,
    sources: &mut [SourceInfo],
    scratch: &mut NamedTempFile,
) -> Result<()> {
    let stream = auto_decompress(old_reader)?;
    let mut archive = Archive::new(stream);

    let mut offset = 0u64;
    let dest = scratch.as_file_mut();
    for (index, entry) in archive.entries()?.enumerate() {
        let mut entry = entry?;
        let Some(&source) = source_by_index.get(&index) else {
            continue;
        };
        if !sources[source].used_for_delta {
            continue;
        }
        sources[source].offset = offset;
        offset += std::io::copy(&mut entry, dest)?;
    }
    dest.flush()?;
    Ok(())
}

/// Pair new files with old files and build the scratch file.
///
/// `old_reader` must be rewound to the start of the old archive; it is read
/// once more to extract the chosen source payloads.
pub fn analyze_for_delta<R: Read>(
    old: TarInfo,
    new: TarInfo,
    old_reader: R,
) -> Result<DeltaAnalysis> {
    let old_files = old.files;
    let new_files = new.files;

    let mut sources: Vec<SourceInfo> = (0..old_files.len())
        .map(|i| SourceInfo {
            file: i,
            used_for_delta: false,
            offset: 0,
        })
        .collect();

    let mut source_by_sha1: HashMap<&str, usize> = HashMap::new();
    let mut source_by_path: HashMap<&str, usize> = HashMap::new();
    let mut source_by_index: HashMap<usize, usize> = HashMap::new();
    for (i, file) in old_files.iter().enumerate() {
        if !file.overwritten {
            source_by_sha1.insert(&file.sha1, i);
            source_by_path.insert(&file.path, i);
            source_by_index.insert(file.index, i);
        }
    }

    let mut targets: Vec<TargetInfo> = Vec::with_capacity(new_files.len());
    for (file_idx, file) in new_files.iter().enumerate() {
        // Exact content match first: the whole file can be reused as-is
        let mut used_for_delta = false;
        let mut source = source_by_sha1
            .get(file.sha1.as_str())
            .copied()
            .filter(|&s| old_files[s].size == file.size);

        if source.is_none() && is_delta_candidate(file) {
            // Same path is the strongest hint for a changed file
            let same_path = source_by_path.get(file.path.as_str()).copied().filter(|&s| {
                is_delta_candidate(&old_files[s]) && size_is_similar(file, &old_files[s])
            });
            if same_path.is_some() {
                used_for_delta = true;
                source = same_path;
            } else {
                // Then moved files, then renames to similar names, keeping
                // the candidate closest in size
                for fuzzy in 0..2u32 {
                    for (s, old_file) in old_files.iter().enumerate() {
                        if old_file.overwritten
                            || !is_delta_candidate(old_file)
                            || !name_is_similar(file, old_file, fuzzy)
                            || !size_is_similar(file, old_file)
                        {
                            continue;
                        }
                        if let Some(best) = source {
                            if old_files[best].size.abs_diff(file.size)
                                < old_file.size.abs_diff(file.size)
                            {
                                continue;
                            }
                        }
                        used_for_delta = true;
                        source = Some(s);
                    }
                    if source.is_some() {
                        break;
                    }
                }
            }
        }

        let mut matches = None;
        if let Some(s) = source {
            sources[s].used_for_delta = sources[s].used_for_delta || used_for_delta;
            if used_for_delta {
                matches = Some(compute_chunk_matches(
                    &old_files[sources[s].file].chunks,
                    &file.chunks,
                ));
            }
        }
        targets.push(TargetInfo {
            file: file_idx,
            source,
            matches,
        });
    }

    let target_by_index: HashMap<usize, usize> = targets
        .iter()
        .enumerate()
        .map(|(i, t)| (new_files[t.file].index, i))
        .collect();

    let mut scratch = NamedTempFile::new()?;
    extract_delta_data(old_reader, &source_by_index, &mut sources, &mut scratch)?;

    debug!(
        "matched {} of {} new files",
        targets.iter().filter(|t| t.source.is_some()).count(),
        targets.len()
    );

    Ok(DeltaAnalysis {
        old_files,
        new_files,
        sources,
        targets,
        target_by_index,
        scratch,
    })
}
