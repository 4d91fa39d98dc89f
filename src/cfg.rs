//! CFGDATA configuration database module
//!
//! A CFGDATA blob is a tag-indexed stream of bit-packed records that holds board settings for up
//! to 32 platforms at once. Records carry a platform bitmask in their condition word, and array
//! tables for non-base platforms are stored as deltas against a shared base table.

mod array;
mod merge;
mod parser;
mod query;
mod record;

/// The magic signature at the start of every blob
pub const SIGNATURE: [u8; 4] = *b"CFGD";

/// The reserved tag of the record that names the platform a blob belongs to
pub const PLATFORM_ID_TAG: u16 = 0x0F0;

/// The highest platform id a blob can describe
pub const MAX_PLATFORM_ID: u8 = 31;

/// Platform mask that applies to every platform
pub const ALL_PLATFORMS: u32 = 0xFFFF_FFFF;

pub use array::{reconstruct, restore_base, ArrayTables};
pub use merge::{CreateOptions, MergeEngine, SourceFile};
pub use parser::{parse, FilePlatform, ParsedBlob, ParsedRecord};
pub use query::Resolver;
pub use record::{
    ArrayPayload, BasePlatform, BlobHeader, ConfigBlob, ConfigRecord, Payload, RecordType,
    Reference, TagHeader, ARRAY_HEADER_SIZE, BLOB_HEADER_SIZE, TAG_HEADER_SIZE,
};

/// Returns the platform mask with only `platform_id` set
pub fn platform_bit(platform_id: u8) -> u32 {
    1u32 << (platform_id & MAX_PLATFORM_ID)
}

/// Returns the lowest platform id set in `mask`, if any
pub fn first_platform(mask: u32) -> Option<u8> {
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros() as u8)
    }
}
