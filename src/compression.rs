//! Autodetection and streaming decompression of tar archive inputs
//!
//! Both archives handed to `diff` may be gzip, xz or bzip2 compressed, or a
//! plain tar. The format is sniffed from the leading magic bytes without
//! consuming them, and the caller gets back a reader that yields the raw tar
//! stream either way.

use std::io::{Cursor, Read};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tracing::debug;
use xz2::read::XzDecoder;

use crate::error::Result;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const BZIP2_MAGIC: &[u8] = b"BZh";

/// Compression format of an archive, as sniffed from its first bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Gzip,
    Xz,
    Bzip2,
    Plain,
}

/// Detect the compression format from the first bytes of a stream
pub fn detect(head: &[u8]) -> Format {
    if head.starts_with(GZIP_MAGIC) {
        Format::Gzip
    } else if head.starts_with(XZ_MAGIC) {
        Format::Xz
    } else if head.starts_with(BZIP2_MAGIC) {
        Format::Bzip2
    } else {
        Format::Plain
    }
}

/// Wrap a reader in the matching decompressor, passing plain data through.
///
/// The sniffed bytes are put back in front of the stream, so the decoder
/// sees the input from its very first byte.
pub fn auto_decompress<'a, R: Read + 'a>(reader: R) -> Result<Box<dyn Read + 'a>> {
    let mut reader = reader;
    let mut head = [0u8; 6];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let format = detect(&head[..filled]);
    debug!("detected archive format: {:?}", format);

    let stream = Cursor::new(head[..filled].to_vec()).chain(reader);
    Ok(match format {
        Format::Gzip => Box::new(GzDecoder::new(stream)),
        Format::Xz => Box::new(XzDecoder::new(stream)),
        Format::Bzip2 => Box::new(BzDecoder::new(stream)),
        Format::Plain => Box::new(stream),
    })
}
