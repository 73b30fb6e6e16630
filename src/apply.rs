//! Delta application
//!
//! The applier is a small virtual machine over the opcode stream described
//! in [`crate::delta`]: literal data is copied through, while copy, seek and
//! add-data opcodes pull bytes out of source files resolved through a
//! [`SourceProvider`]. At most one source file is open at a time.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::delta::{
    read_uvarint, DELTA_MAGIC, OP_ADD_DATA, OP_COPY, OP_DATA, OP_OPEN, OP_SEEK,
};
use crate::error::{DeltaError, Result};

/// A random-access byte source for one old-archive file
pub trait SourceFile: Read + Seek {}

impl<T: Read + Seek> SourceFile for T {}

/// Capability handed to the applier for resolving OPEN opcodes.
///
/// Given the relative path of an old-archive file, returns its contents as
/// a seekable stream positioned at 0.
pub trait SourceProvider {
    fn open(&self, path: &str) -> Result<Box<dyn SourceFile>>;
}

/// Resolves source paths under a directory holding the extracted old archive
pub struct DirSourceProvider {
    root: PathBuf,
}

impl DirSourceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirSourceProvider { root: root.into() }
    }
}

impl SourceProvider for DirSourceProvider {
    fn open(&self, path: &str) -> Result<Box<dyn SourceFile>> {
        let relative = Path::new(path);
        // Producer paths are normalized; anything else cannot come from a
        // well-formed delta.
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DeltaError::InvalidDelta(format!(
                "unsafe source path {path:?}"
            )));
        }
        Ok(Box::new(File::open(self.root.join(relative))?))
    }
}

/// Read one opcode tag, or `None` at a clean end of stream
fn read_tag<R: Read>(reader: &mut R) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Copy exactly `size` bytes between streams, failing on a short read
fn copy_exact<R: Read + ?Sized, W: Write>(reader: &mut R, writer: &mut W, size: u64) -> Result<()> {
    let copied = io::copy(&mut (&mut *reader).take(size), writer)?;
    if copied != size {
        return Err(DeltaError::InvalidDelta(format!(
            "stream ended after {copied} of {size} bytes"
        )));
    }
    Ok(())
}

/// Reconstruct the raw new tar from a delta stream.
///
/// `sources` resolves the old-archive file paths named by the delta; the
/// reconstructed tar bytes are written to `out`.
pub fn apply<R: Read, W: Write>(
    delta: R,
    sources: &dyn SourceProvider,
    out: &mut W,
) -> Result<()> {
    let mut delta = delta;
    let mut magic = [0u8; DELTA_MAGIC.len()];
    delta.read_exact(&mut magic)?;
    if magic != *DELTA_MAGIC {
        return Err(DeltaError::InvalidDelta(
            "magic header mismatch".to_string(),
        ));
    }

    let mut reader = zstd::stream::Decoder::new(delta)?;
    let mut source: Option<Box<dyn SourceFile>> = None;

    while let Some(tag) = read_tag(&mut reader)? {
        let size = read_uvarint(&mut reader)?;
        match tag {
            OP_DATA => copy_exact(&mut reader, out, size)?,
            OP_OPEN => {
                let mut name = vec![0u8; size as usize];
                reader.read_exact(&mut name)?;
                let name = String::from_utf8(name).map_err(|_| {
                    DeltaError::InvalidDelta("source path is not UTF-8".to_string())
                })?;
                debug!(path = %name, "opening source file");
                source = Some(sources.open(&name)?);
            }
            OP_COPY => {
                let file = source.as_mut().ok_or(DeltaError::NoSourceOpen("copy"))?;
                copy_exact(file.as_mut(), out, size)?;
            }
            OP_ADD_DATA => {
                let file = source.as_mut().ok_or(DeltaError::NoSourceOpen("add-data"))?;
                let mut payload = Vec::new();
                reader.by_ref().take(size).read_to_end(&mut payload)?;
                if payload.len() as u64 != size {
                    return Err(DeltaError::InvalidDelta(format!(
                        "add-data payload ended after {} of {size} bytes",
                        payload.len()
                    )));
                }
                let mut base = vec![0u8; payload.len()];
                file.read_exact(&mut base)?;
                for (delta_byte, source_byte) in payload.iter_mut().zip(&base) {
                    *delta_byte = delta_byte.wrapping_add(*source_byte);
                }
                out.write_all(&payload)?;
            }
            OP_SEEK => {
                let file = source.as_mut().ok_or(DeltaError::NoSourceOpen("seek"))?;
                file.seek(SeekFrom::Start(size))?;
            }
            tag => return Err(DeltaError::UnknownOpcode(tag)),
        }
    }

    Ok(())
}
