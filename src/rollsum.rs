//! Content-defined rolling chunker
//!
//! Splits a byte stream into variable-sized chunks whose boundaries depend
//! only on the content, using the bup/librsync variant of an Adler-style
//! rolling sum. Identical data always produces identical chunk boundaries,
//! which lets us find unchanged regions between two versions of a file by
//! comparing per-chunk CRCs.

use std::collections::HashMap;

/// Hard upper bound on a single chunk
pub const MAX_CHUNK: u64 = 8192 * 4;

// librsync suggests a non-zero offset to improve the checksum; 31 measured
// slightly better than 0 or 7919 on typical data.
const CHAR_OFFSET: u32 = 31;

const CHUNK_BITS: u32 = 13;
const CHUNK_TRIGGER: u32 = (1 << CHUNK_BITS) - 1;
const WINDOW_BITS: u32 = 7;
const WINDOW_SIZE: usize = 1 << WINDOW_BITS;

/// One content-defined chunk of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Absolute offset within the file
    pub offset: u64,
    /// Chunk length in bytes, 1..=MAX_CHUNK
    pub size: u64,
    /// IEEE CRC-32 over the chunk bytes
    pub crc32: u32,
}

/// Streaming chunker state
pub struct RollingChunker {
    chunk_start: u64,
    chunk_size: u64,
    crc: crc32fast::Hasher,

    // rolling sum used to decide where to split
    s1: u32,
    s2: u32,
    window: [u8; WINDOW_SIZE],
    wofs: usize,

    chunks: Vec<Chunk>,
}

impl RollingChunker {
    pub fn new() -> Self {
        let mut chunker = RollingChunker {
            chunk_start: 0,
            chunk_size: 0,
            crc: crc32fast::Hasher::new(),
            s1: 0,
            s2: 0,
            window: [0; WINDOW_SIZE],
            wofs: 0,
            chunks: Vec::new(),
        };
        chunker.reset_sums();
        chunker
    }

    fn reset_sums(&mut self) {
        let window = WINDOW_SIZE as u32;
        self.s1 = window * CHAR_OFFSET;
        self.s2 = window * (window - 1) * CHAR_OFFSET;
        self.window = [0; WINDOW_SIZE];
        self.wofs = 0;
    }

    fn roll(&mut self, byte: u8) {
        self.chunk_size += 1;
        let dropped = self.window[self.wofs];
        self.s1 = self
            .s1
            .wrapping_add(byte as u32)
            .wrapping_sub(dropped as u32);
        self.s2 = self.s2.wrapping_add(self.s1).wrapping_sub(
            (WINDOW_SIZE as u32).wrapping_mul((dropped as u32).wrapping_add(CHAR_OFFSET)),
        );
        self.window[self.wofs] = byte;
        self.wofs = (self.wofs + 1) % WINDOW_SIZE;
    }

    fn should_split(&self) -> bool {
        self.chunk_size == MAX_CHUNK || (self.s2 & CHUNK_TRIGGER) == CHUNK_TRIGGER
    }

    fn take_chunk(&mut self) {
        let crc = std::mem::take(&mut self.crc).finalize();
        self.chunks.push(Chunk {
            offset: self.chunk_start,
            size: self.chunk_size,
            crc32: crc,
        });
        self.chunk_start += self.chunk_size;
        self.chunk_size = 0;
        self.reset_sums();
    }

    /// Feed more data into the chunker
    pub fn update(&mut self, data: &[u8]) {
        let mut start = 0;
        for (i, &byte) in data.iter().enumerate() {
            self.roll(byte);
            if self.should_split() {
                self.crc.update(&data[start..=i]);
                start = i + 1;
                self.take_chunk();
            }
        }
        if start < data.len() {
            self.crc.update(&data[start..]);
        }
    }

    /// Flush the trailing partial chunk and return the chunk list
    pub fn finish(mut self) -> Vec<Chunk> {
        if self.chunk_size > 0 {
            self.take_chunk();
        }
        self.chunks
    }
}

impl Default for RollingChunker {
    fn default() -> Self {
        Self::new()
    }
}

/// One pairing of a source chunk with a target chunk of equal size and CRC
#[derive(Debug, Clone, Copy)]
pub struct ChunkMatch {
    pub from: Chunk,
    pub to: Chunk,
}

/// All chunk pairings between one source file and one target file
#[derive(Debug, Clone)]
pub struct ChunkMatches {
    /// Matches in ascending target-offset order
    pub matches: Vec<ChunkMatch>,
    /// Percentage of target chunks that found a source chunk
    pub match_ratio: u32,
    /// Total size of the matched target chunks
    pub match_size: u64,
}

/// Pair up chunks of a source and a target file by (crc32, size).
///
/// CRC collisions are tolerated here; the delta generator re-compares the
/// actual bytes before reusing a chunk.
pub fn compute_chunk_matches(from: &[Chunk], to: &[Chunk]) -> ChunkMatches {
    let mut from_by_crc: HashMap<u32, Vec<&Chunk>> = HashMap::new();
    for chunk in from {
        from_by_crc.entry(chunk.crc32).or_default().push(chunk);
    }

    let mut matches = Vec::new();
    let mut match_size = 0u64;
    for target in to {
        let Some(candidates) = from_by_crc.get(&target.crc32) else {
            continue;
        };
        // Same crc but different length is a non-match
        if let Some(source) = candidates.iter().find(|c| c.size == target.size) {
            match_size += source.size;
            matches.push(ChunkMatch {
                from: **source,
                to: *target,
            });
        }
    }

    let match_ratio = if to.is_empty() {
        0
    } else {
        matches.len() as u32 * 100 / to.len() as u32
    };

    ChunkMatches {
        matches,
        match_ratio,
        match_size,
    }
}
