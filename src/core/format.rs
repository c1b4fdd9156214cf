//! Purpose: Centralize bolt on-disk format constants and compatibility errors.
//! Exports: `MAGIC`, `FORMAT_VERSION`, page flags, `format_version_error`.
//! Role: Shared policy for gating on-disk compatibility across open and page decoding.
//! Invariants: Only format version 2 (bolt/bbolt) is readable; nothing here writes.
//! Invariants: Error messages mirror the engine's own wording so operators can search them.

use crate::core::error::{Error, ErrorKind};

pub const MAGIC: u32 = 0xED0C_DAED;
pub const FORMAT_VERSION: u32 = 2;
pub const SUPPORTED_FORMAT_VERSIONS: &[u32] = &[FORMAT_VERSION];

pub const PAGE_HEADER_LEN: usize = 16;
pub const ELEMENT_LEN: usize = 16;
pub const BUCKET_HEADER_LEN: usize = 16;
pub const META_LEN: usize = 64;
/// Bytes of the meta struct covered by its checksum (everything before the checksum field).
pub const META_CHECKSUM_OFFSET: usize = 56;

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x10;

pub const BUCKET_LEAF_FLAG: u32 = 0x01;

/// Page size used to locate the second meta page when the first is unreadable.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

pub fn format_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Corrupt)
        .with_message(format!(
            "version mismatch: found {detected} (supported: {supported})"
        ))
        .with_hint("The file was written by an incompatible bolt release.")
}
