//! Delta stream format and opcode writer
//!
//! A delta file starts with a fixed magic header, followed by a single zstd
//! frame. The decompressed frame is a sequence of records, each a one-byte
//! opcode tag, an unsigned LEB128 size and an optional payload of that size:
//!
//! - `DATA`     - `size` literal bytes, copied to the output
//! - `OPEN`     - `size` bytes of UTF-8 path; switch the current source file
//! - `COPY`     - copy `size` bytes from the current source file position
//! - `ADD_DATA` - `size` payload bytes, added (mod 256) to the same number
//!   of bytes read from the current source file position
//! - `SEEK`     - set the current source file position to `size`
//!
//! The writer tracks the source position the applier will be at after each
//! opcode, so redundant seeks and opens are elided.

use std::io::{Read, Write};

use crate::error::{DeltaError, Result};

/// Magic bytes identifying a delta stream, format version included
pub const DELTA_MAGIC: &[u8; 8] = b"tardf1\n\0";

pub const OP_DATA: u8 = 0;
pub const OP_OPEN: u8 = 1;
pub const OP_COPY: u8 = 2;
pub const OP_ADD_DATA: u8 = 3;
pub const OP_SEEK: u8 = 4;

/// Longest accepted LEB128 encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Pending literal data is flushed as one DATA opcode at this size
const DATA_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Encode `value` as unsigned LEB128 into `buf`, returning the length used
pub fn put_uvarint(buf: &mut [u8; MAX_VARINT_LEN], mut value: u64) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = value as u8 | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

/// Decode one unsigned LEB128 value from `reader`
pub fn read_uvarint<R: Read>(reader: &mut R) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        let byte = byte[0];
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(DeltaError::InvalidDelta("varint overflows u64".to_string()));
            }
            return Ok(value | (byte as u64) << shift);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(DeltaError::InvalidDelta("varint longer than 10 bytes".to_string()))
}

/// Emits the delta opcode stream into a zstd-compressed container
pub struct DeltaWriter<W: Write> {
    encoder: Option<zstd::stream::Encoder<'static, W>>,
    buffer: Vec<u8>,
    current_file: String,
    current_pos: u64,
}

impl<W: Write> DeltaWriter<W> {
    /// Write the magic header and open the zstd frame
    pub fn new(mut writer: W, compression_level: i32) -> Result<Self> {
        writer.write_all(DELTA_MAGIC)?;
        let encoder = zstd::stream::Encoder::new(writer, compression_level)?;
        Ok(DeltaWriter {
            encoder: Some(encoder),
            buffer: Vec::new(),
            current_file: String::new(),
            current_pos: 0,
        })
    }

    fn encoder(&mut self) -> Result<&mut zstd::stream::Encoder<'static, W>> {
        self.encoder.as_mut().ok_or_else(|| {
            DeltaError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "delta stream already closed",
            ))
        })
    }

    fn write_op(&mut self, op: u8, size: u64, payload: Option<&[u8]>) -> Result<()> {
        let mut head = [0u8; 1 + MAX_VARINT_LEN];
        head[0] = op;
        let mut varint = [0u8; MAX_VARINT_LEN];
        let varint_len = put_uvarint(&mut varint, size);
        head[1..1 + varint_len].copy_from_slice(&varint[..varint_len]);

        let encoder = self.encoder()?;
        encoder.write_all(&head[..1 + varint_len])?;
        if let Some(data) = payload {
            encoder.write_all(data)?;
        }
        Ok(())
    }

    /// Flush pending literal data as one DATA opcode
    pub fn flush_data(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.buffer);
        self.write_op(OP_DATA, buffer.len() as u64, Some(&buffer))?;
        // keep the allocation for the next batch
        self.buffer = buffer;
        self.buffer.clear();
        Ok(())
    }

    /// Append literal output bytes, flushing once the pending buffer is full
    pub fn write_content(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= DATA_CHUNK_SIZE {
            self.flush_data()?;
        }
        Ok(())
    }

    /// Switch the applier to a new source file, rewinding to its start
    pub fn set_current_file(&mut self, name: &str) -> Result<()> {
        if self.current_file != name {
            self.flush_data()?;
            self.write_op(OP_OPEN, name.len() as u64, Some(name.as_bytes()))?;
            self.current_file = name.to_string();
            self.current_pos = 0;
        }
        Ok(())
    }

    /// Position the source file cursor, eliding seeks to the current position
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if self.current_pos == pos {
            return Ok(());
        }
        self.flush_data()?;
        self.write_op(OP_SEEK, pos, None)?;
        self.current_pos = pos;
        Ok(())
    }

    /// Move the source cursor relative to the tracked position
    pub fn seek_forward(&mut self, delta: i64) -> Result<()> {
        self.seek(self.current_pos.wrapping_add_signed(delta))
    }

    /// Copy `size` bytes from the source cursor to the output
    pub fn copy_file(&mut self, size: u64) -> Result<()> {
        self.flush_data()?;
        self.write_op(OP_COPY, size, None)?;
        self.current_pos += size;
        Ok(())
    }

    /// Copy `size` source bytes starting at `offset`
    pub fn copy_file_at(&mut self, offset: u64, size: u64) -> Result<()> {
        self.seek(offset)?;
        self.copy_file(size)
    }

    /// Reproduce a whole source file at the output position
    pub fn write_old_file(&mut self, name: &str, size: u64) -> Result<()> {
        self.set_current_file(name)?;
        self.seek(0)?;
        self.copy_file(size)
    }

    /// Emit an ADD_DATA record; the applier consumes the same number of
    /// source bytes, so the tracked position advances too.
    pub fn write_add_content(&mut self, data: &[u8]) -> Result<()> {
        self.flush_data()?;
        self.write_op(OP_ADD_DATA, data.len() as u64, Some(data))?;
        self.current_pos += data.len() as u64;
        Ok(())
    }

    /// Flush pending data and finalize the zstd frame
    pub fn close(&mut self) -> Result<()> {
        self.flush_data()?;
        if let Some(encoder) = self.encoder.take() {
            encoder.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build a delta with a scoped writer and hand back the raw bytes
    fn build(emit: impl FnOnce(&mut DeltaWriter<&mut Vec<u8>>)) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = DeltaWriter::new(&mut out, 3).unwrap();
            emit(&mut writer);
            writer.close().unwrap();
        }
        out
    }

    fn decode_frame(delta: &[u8]) -> Vec<u8> {
        assert_eq!(&delta[..DELTA_MAGIC.len()], DELTA_MAGIC);
        let mut decoded = Vec::new();
        zstd::stream::Decoder::new(&delta[DELTA_MAGIC.len()..])
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        decoded
    }

    /// Decode an opcode stream into (tag, size, payload) records
    fn parse_ops(mut stream: &[u8]) -> Vec<(u8, u64, Vec<u8>)> {
        let mut ops = Vec::new();
        while !stream.is_empty() {
            let tag = stream[0];
            stream = &stream[1..];
            let size = read_uvarint(&mut stream).unwrap();
            let payload = match tag {
                OP_DATA | OP_OPEN | OP_ADD_DATA => {
                    let (payload, rest) = stream.split_at(size as usize);
                    stream = rest;
                    payload.to_vec()
                }
                _ => Vec::new(),
            };
            ops.push((tag, size, payload));
        }
        ops
    }

    fn encode_ops(ops: &[(u8, u64, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, size, payload) in ops {
            out.push(*tag);
            let mut varint = [0u8; MAX_VARINT_LEN];
            let n = put_uvarint(&mut varint, *size);
            out.extend_from_slice(&varint[..n]);
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = [0u8; MAX_VARINT_LEN];
            let n = put_uvarint(&mut buf, value);
            let mut cursor = Cursor::new(&buf[..n]);
            assert_eq!(read_uvarint(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn test_varint_max_length() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        assert_eq!(put_uvarint(&mut buf, u64::MAX), 10);
    }

    #[test]
    fn test_varint_overflow_rejected() {
        // 10 continuation-less bytes encoding more than 64 bits
        let bad = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02];
        assert!(matches!(
            read_uvarint(&mut Cursor::new(&bad[..])),
            Err(DeltaError::InvalidDelta(_))
        ));

        let too_long = [0x80u8; 10];
        assert!(matches!(
            read_uvarint(&mut Cursor::new(&too_long[..])),
            Err(DeltaError::InvalidDelta(_))
        ));
    }

    #[test]
    fn test_writer_emits_expected_opcodes() {
        let out = build(|writer| {
            writer.write_content(b"header bytes").unwrap();
            writer.write_old_file("usr/bin/foo", 10).unwrap();
            writer.write_content(b"padding").unwrap();
        });

        let ops = parse_ops(&decode_frame(&out));
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0], (OP_DATA, 12, b"header bytes".to_vec()));
        assert_eq!(ops[1], (OP_OPEN, 11, b"usr/bin/foo".to_vec()));
        assert_eq!(ops[2], (OP_COPY, 10, Vec::new()));
        assert_eq!(ops[3], (OP_DATA, 7, b"padding".to_vec()));
    }

    #[test]
    fn test_redundant_seek_and_open_elided() {
        let out = build(|writer| {
            writer.set_current_file("f").unwrap();
            writer.seek(0).unwrap(); // already there
            writer.copy_file(5).unwrap();
            writer.set_current_file("f").unwrap(); // same file
            writer.seek(5).unwrap(); // already there after the copy
            writer.copy_file(3).unwrap();
            writer.copy_file_at(0, 2).unwrap(); // needs a real seek
        });

        let ops = parse_ops(&decode_frame(&out));
        let tags: Vec<u8> = ops.iter().map(|(t, _, _)| *t).collect();
        assert_eq!(tags, vec![OP_OPEN, OP_COPY, OP_COPY, OP_SEEK, OP_COPY]);
        assert_eq!(ops[3].1, 0);
    }

    #[test]
    fn test_add_content_advances_position() {
        let out = build(|writer| {
            writer.set_current_file("f").unwrap();
            writer.write_add_content(&[1, 2, 3, 4]).unwrap();
            // The applier's cursor moved by 4, so this seek must be elided
            writer.seek(4).unwrap();
            writer.copy_file(1).unwrap();
        });

        let ops = parse_ops(&decode_frame(&out));
        let tags: Vec<u8> = ops.iter().map(|(t, _, _)| *t).collect();
        assert_eq!(tags, vec![OP_OPEN, OP_ADD_DATA, OP_COPY]);
    }

    #[test]
    fn test_seek_forward_backwards() {
        let out = build(|writer| {
            writer.set_current_file("f").unwrap();
            writer.copy_file(100).unwrap();
            writer.seek_forward(-40).unwrap();
            writer.copy_file(1).unwrap();
        });

        let ops = parse_ops(&decode_frame(&out));
        assert_eq!(ops[2].0, OP_SEEK);
        assert_eq!(ops[2].1, 60);
    }

    #[test]
    fn test_framing_idempotent() {
        let out = build(|writer| {
            writer.write_content(b"some literal data").unwrap();
            writer.write_old_file("lib/libz.so.1", 4096).unwrap();
            writer.write_add_content(&[0, 1, 255, 128]).unwrap();
            writer.seek_forward(123).unwrap();
            writer.copy_file(77).unwrap();
        });

        let stream = decode_frame(&out);
        assert_eq!(encode_ops(&parse_ops(&stream)), stream);
    }
}
