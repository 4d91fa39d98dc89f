use std::io;

use thiserror::Error;

/// Structural errors in the binary layout of a blob or record
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum FormatError {
    #[error("The blob signature is invalid: {:?}", _0)]
    BadMagic([u8; 4]),
    #[error("The {} length {:#x} is not a multiple of 4", _0, _1)]
    MisalignedLength(&'static str, usize),
    #[error(
        "Truncated buffer - expected {} bytes at offset {:#x}, only {} available",
        needed,
        offset,
        available
    )]
    TruncatedBuffer {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Records consume {} bytes, but the blob header declares {}", consumed, declared)]
    LengthMismatch { consumed: usize, declared: usize },
    #[error("Record at offset {:#x} has an unknown type {}", _0, _1)]
    UnknownRecordType(usize, u8),
    #[error("Record at offset {:#x} sets reserved flag bits in {:#x}", _0, _1)]
    ReservedFlags(usize, u8),
    #[error("Record for tag {:#05x} is {} bytes, which does not fit the length field", _0, _1)]
    RecordTooLarge(u16, usize),
    #[error("The blob header length {} is invalid", _0)]
    BadHeaderLength(u8),
    #[error(
        "Record at offset {:#x} declares a length of {} bytes, shorter than its header",
        _0,
        _1
    )]
    BadRecordLength(usize, usize),
    #[error("Payload of tag {:#05x} has an invalid length of {} bytes", _0, _1)]
    BadPayloadLength(u16, usize),
    #[error("Record for tag {:#05x} has {} condition words, at most 3 are allowed", _0, _1)]
    TooManyConditions(u16, usize),
    #[error("Blob of {} bytes is too large", _0)]
    BlobTooLarge(usize),
}

/// Errors in the meaning of otherwise well-formed records
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SemanticError {
    #[error("Invalid platform id {:#x} - must be between 0 and 31", _0)]
    InvalidPlatformId(u16),
    #[error("The blob is not merged and does not contain a platform id record")]
    MissingPlatformId,
    #[error("Tag {:#05x} occurs more than once", _0)]
    DuplicateTag(u16),
    #[error("Array for tag {:#05x} contains item id {:#x} more than once", _0, _1)]
    DuplicateItemId(u16, u64),
    #[error("Array for tag {:#05x} contains item id {:#x}, which is not in the base table", _0, _1)]
    UnknownItemId(u16, u64),
    #[error("Array for tag {:#05x} does not match the layout of its base table", _0)]
    ArrayLayoutMismatch(u16),
    #[error(
        "Platform {} owns the base table for tag {:#05x}, but supplied a different one",
        _1,
        _0
    )]
    ConflictingBaseTable(u16, u8),
    #[error("Invalid base platform id {:#04x}", _0)]
    InvalidBasePlatform(u8),
    #[error("Platform id {} is out of range - there are only 32 platforms", _0)]
    NoSuchPlatform(u8),
    #[error("Reference chain for tag {:#05x} is too deep", _0)]
    ReferenceLoop(u16),
}

/// Errors where an array table cannot hold what it declares
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum CapacityError {
    #[error("Array bitmask of {} bytes is too small for {} items", bitmask_len, item_count)]
    ArrayTooSmall {
        bitmask_len: usize,
        item_count: usize,
    },
    #[error("Array needs {} bytes, but only {} are available", needed, available)]
    ArrayDataTooSmall { needed: usize, available: usize },
    #[error("Invalid array layout: {}", _0)]
    InvalidArrayLayout(&'static str),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Format error: {}", _0)]
    Format(#[from] FormatError),

    #[error("Semantic error: {}", _0)]
    Semantic(#[from] SemanticError),

    #[error("Capacity error: {}", _0)]
    Capacity(#[from] CapacityError),

    #[error("Tag {:#05x} was not found for platform {}", tag, platform_id)]
    TagNotFound { tag: u16, platform_id: u8 },

    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}
