//! Per-file delta strategies and the top-level `diff` entry point
//!
//! The new tar is streamed once through a [`StealerReader`] feeding the
//! delta writer, so everything the tar parser consumes (headers, padding,
//! payloads nobody matched) lands in the delta as literal data. For each
//! file with a matched source the generator switches the reader to discard
//! mode and encodes the payload with one of three strategies instead:
//! verbatim reuse of the old file, bsdiff, or rolling-chunk reuse.

use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use tar::Archive;
use tracing::debug;

use crate::analysis::{analyze_for_delta, analyze_tar, DeltaAnalysis, TargetInfo};
use crate::bsdiff::bsdiff;
use crate::compression::auto_decompress;
use crate::delta::DeltaWriter;
use crate::error::Result;
use crate::stealer::{StealMode, StealSwitch, StealerReader};

const DEFAULT_MAX_BSDIFF_SIZE: u64 = 192 * 1024 * 1024;

/// Chunk reuse needs at least this percentage of matched chunks to beat
/// plain literal data.
const MIN_CHUNK_MATCH_RATIO: u32 = 20;

/// Tunables for delta generation
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// zstd level for the delta container
    pub compression_level: i32,
    /// Files at or above this size fall back from bsdiff to chunk matching;
    /// 0 disables the limit
    pub max_bsdiff_size: u64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        DiffOptions {
            compression_level: 3,
            max_bsdiff_size: DEFAULT_MAX_BSDIFF_SIZE,
        }
    }
}

/// Generate a delta that rebuilds the raw `new` tar from files extracted
/// out of the `old` tar.
///
/// Both archives are read twice, once for analysis and once for streaming,
/// so the readers must support rewinding.
pub fn diff<O, N, W>(old: &mut O, new: &mut N, delta_out: W, options: &DiffOptions) -> Result<()>
where
    O: Read + Seek,
    N: Read + Seek,
    W: Write,
{
    let old_info = analyze_tar(&mut *old)?;
    let new_info = analyze_tar(&mut *new)?;

    old.seek(SeekFrom::Start(0))?;
    new.seek(SeekFrom::Start(0))?;

    let mut analysis = analyze_for_delta(old_info, new_info, old)?;
    generate_delta(new, &mut analysis, delta_out, options)
}

/// Write handle shared between the stealing reader and the generator
struct SharedWriter<W: Write>(Rc<RefCell<DeltaWriter<W>>>);

impl<W: Write> Write for SharedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .borrow_mut()
            .write_content(buf)
            .map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn generate_delta<N, W>(
    new_reader: &mut N,
    analysis: &mut DeltaAnalysis,
    delta_out: W,
    options: &DiffOptions,
) -> Result<()>
where
    N: Read,
    W: Write,
{
    let tar_stream = auto_decompress(new_reader)?;
    let writer = Rc::new(RefCell::new(DeltaWriter::new(
        delta_out,
        options.compression_level,
    )?));
    let switch = StealSwitch::new();
    let stealer = StealerReader::new(tar_stream, SharedWriter(Rc::clone(&writer)), switch.clone());
    let mut archive = Archive::new(stealer);

    {
        let mut entries = archive.entries()?;
        let mut index = 0usize;
        loop {
            // Header blocks and the previous entry's padding must always be
            // captured as literal data.
            switch.set(StealMode::PassThrough);
            let Some(next) = entries.next() else { break };
            let mut entry = next?;

            let target = analysis
                .target_for_index(index)
                .filter(|t| t.source.is_some())
                .cloned();
            if let Some(target) = target {
                generate_for_file(analysis, &writer, &switch, &mut entry, &target, options)?;
            }
            index += 1;
        }
    }

    // Pick up trailing padding after the last entry
    switch.set(StealMode::PassThrough);
    let mut stealer = archive.into_inner();
    io::copy(&mut stealer, &mut io::sink())?;
    drop(stealer);

    let result = writer.borrow_mut().close();
    result
}

/// Discard the rest of the current entry without capturing it
fn skip_rest<R: Read>(switch: &StealSwitch, entry: &mut tar::Entry<'_, R>) -> Result<()> {
    switch.set(StealMode::Discard);
    io::copy(entry, &mut io::sink())?;
    Ok(())
}

/// Stream the rest of the current entry into the delta as literal data
fn copy_rest<R: Read>(switch: &StealSwitch, entry: &mut tar::Entry<'_, R>) -> Result<()> {
    switch.set(StealMode::PassThrough);
    io::copy(entry, &mut io::sink())?;
    Ok(())
}

/// Read the next `n` payload bytes without capturing them
fn read_n<R: Read>(
    switch: &StealSwitch,
    entry: &mut tar::Entry<'_, R>,
    n: usize,
) -> Result<Vec<u8>> {
    switch.set(StealMode::Discard);
    let mut buf = vec![0u8; n];
    entry.read_exact(&mut buf)?;
    Ok(buf)
}

/// Stream the next `n` payload bytes into the delta as literal data
fn copy_n<R: Read>(switch: &StealSwitch, entry: &mut tar::Entry<'_, R>, n: u64) -> Result<()> {
    switch.set(StealMode::PassThrough);
    let copied = io::copy(&mut entry.by_ref().take(n), &mut io::sink())?;
    if copied != n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "tar entry ended before expected payload length",
        )
        .into());
    }
    Ok(())
}

fn generate_for_file<R, W>(
    analysis: &mut DeltaAnalysis,
    writer: &Rc<RefCell<DeltaWriter<W>>>,
    switch: &StealSwitch,
    entry: &mut tar::Entry<'_, R>,
    target: &TargetInfo,
    options: &DiffOptions,
) -> Result<()>
where
    R: Read,
    W: Write,
{
    let Some(source) = target.source else {
        return Ok(());
    };
    let (file_size, file_sha1) = {
        let file = analysis.new_file(target.file);
        (file.size, file.sha1.clone())
    };
    let (source_path, source_size, source_sha1) = {
        let file = analysis.source_file(source);
        (file.path.clone(), file.size, file.sha1.clone())
    };

    if source_sha1 == file_sha1 && source_size == file_size {
        // Reuse the exact file from the old tar
        debug!(path = %source_path, "strategy: reuse");
        writer.borrow_mut().write_old_file(&source_path, source_size)?;
        skip_rest(switch, entry)?;
    } else if options.max_bsdiff_size == 0
        || (file_size < options.max_bsdiff_size && source_size < options.max_bsdiff_size)
    {
        debug!(path = %source_path, "strategy: bsdiff");
        {
            let mut writer = writer.borrow_mut();
            writer.set_current_file(&source_path)?;
            writer.seek(0)?;
        }
        let old_data = analysis.read_source_data(source, 0, source_size as usize)?;
        let new_data = read_n(switch, entry, file_size as usize)?;
        bsdiff(&old_data, &new_data, &mut *writer.borrow_mut())?;
    } else if target
        .matches
        .as_ref()
        .is_some_and(|m| m.match_ratio > MIN_CHUNK_MATCH_RATIO)
    {
        debug!(path = %source_path, "strategy: chunk reuse");
        let matches = target.matches.as_ref().map(|m| m.matches.clone()).unwrap_or_default();
        writer.borrow_mut().set_current_file(&source_path)?;

        let mut pos = 0u64;
        for chunk_match in &matches {
            if pos < chunk_match.to.offset {
                copy_n(switch, entry, chunk_match.to.offset - pos)?;
            }
            // The CRC pairing may collide, so compare the actual bytes
            // before reusing the source chunk.
            let target_data = read_n(switch, entry, chunk_match.to.size as usize)?;
            let source_data = analysis.read_source_data(
                source,
                chunk_match.from.offset,
                chunk_match.to.size as usize,
            )?;
            if target_data == source_data {
                writer
                    .borrow_mut()
                    .copy_file_at(chunk_match.from.offset, chunk_match.from.size)?;
            } else {
                writer.borrow_mut().write_content(&target_data)?;
            }
            pos = chunk_match.to.offset + chunk_match.to.size;
        }
        if pos < file_size {
            copy_n(switch, entry, file_size - pos)?;
        }
    } else {
        // Nothing better than shipping the payload verbatim
        debug!(path = %source_path, "strategy: literal copy");
        copy_rest(switch, entry)?;
    }
    Ok(())
}
