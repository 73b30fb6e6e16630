//! tar-delta - binary deltas between compressed tar archives
//!
//! Given two tar archives (gzip, xz, bzip2 or uncompressed), [`diff`]
//! produces a compact delta stream. [`apply`] combines that delta with the
//! file contents already extracted from the old archive and reconstructs
//! the raw new tar byte for byte. The typical use is shipping container
//! image layer updates, where most files between two versions are unchanged
//! or differ only slightly.
//!
//! Per file, the generator picks the cheapest of three encodings: verbatim
//! reuse of an identical old file, a suffix-array bsdiff, or reuse of
//! individual content-defined chunks located by a rolling checksum.

pub mod analysis;
pub mod apply;
pub mod bsdiff;
pub mod compression;
pub mod delta;
pub mod diff;
pub mod error;
pub mod rollsum;
pub mod stealer;

pub use apply::{apply, DirSourceProvider, SourceFile, SourceProvider};
pub use diff::{diff, DiffOptions};
pub use error::{DeltaError, Result};

/// Crate version, exposed for the CLI tools
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
