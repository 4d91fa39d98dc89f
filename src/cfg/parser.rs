use std::collections::HashSet;

use log::{debug, trace};

use super::array::ArrayTables;
use super::record::{BlobHeader, ConfigBlob, ConfigRecord, Payload};
use super::{first_platform, platform_bit, ALL_PLATFORMS, MAX_PLATFORM_ID, PLATFORM_ID_TAG};
use crate::error::{Error, SemanticError};

/// The platforms a parsed blob belongs to
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FilePlatform {
    /// An unmerged blob for a single platform
    Single(u8),
    /// A merged blob whose records carry their own platform masks
    All,
}

impl FilePlatform {
    /// Returns the platform mask of the blob as a whole
    pub fn mask(self) -> u32 {
        match self {
            FilePlatform::Single(id) => platform_bit(id),
            FilePlatform::All => ALL_PLATFORMS,
        }
    }
}

/// A record together with the platforms it applies to
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParsedRecord {
    pub record: ConfigRecord,
    pub mask: u32,
}

impl ParsedRecord {
    /// Returns `true` if the record applies to `platform_id`
    ///
    /// The platform id record applies to every platform.
    pub fn applies_to(&self, platform_id: u8) -> bool {
        self.record.tag == PLATFORM_ID_TAG || self.mask & platform_bit(platform_id) != 0
    }
}

/// A decoded and validated blob
#[derive(Debug, Clone)]
pub struct ParsedBlob {
    pub header: BlobHeader,
    pub platform: FilePlatform,
    pub records: Vec<ParsedRecord>,
}

impl ParsedBlob {
    /// Returns the first record for `tag` that applies to `platform_id`
    pub fn find(&self, tag: u16, platform_id: u8) -> Option<&ParsedRecord> {
        self.records
            .iter()
            .find(|parsed| parsed.record.tag == tag && parsed.applies_to(platform_id))
    }

    /// Returns the union of the platform masks of all records, excluding the platform id record
    pub fn platforms(&self) -> u32 {
        self.records
            .iter()
            .filter(|parsed| parsed.record.tag != PLATFORM_ID_TAG)
            .fold(0, |mask, parsed| mask | parsed.mask)
    }
}

/// Returns the platform id of an unmerged blob
fn find_platform_id(records: &[ConfigRecord]) -> Result<u8, SemanticError> {
    let id = records
        .iter()
        .find_map(|record| match record.payload {
            Payload::PlatformId { id, .. } => Some(id),
            _ => None,
        })
        .ok_or(SemanticError::MissingPlatformId)?;

    if id > MAX_PLATFORM_ID as u16 {
        return Err(SemanticError::InvalidPlatformId(id));
    }

    Ok(id as u8)
}

/// Asserts that every tag occurs once, except in reference records
fn check_unique_tags(records: &[ConfigRecord]) -> Result<(), SemanticError> {
    let mut seen = HashSet::with_capacity(records.len());

    for record in records {
        if let Payload::Reference(_) = record.payload {
            continue;
        }

        if !seen.insert(record.tag) {
            return Err(SemanticError::DuplicateTag(record.tag));
        }
    }

    Ok(())
}

/// Parses the blob in `buffer`
///
/// Unmerged blobs must contain a platform id record and every record gets that platform's mask.
/// In merged blobs the first condition word of a record is its platform mask.
///
/// When `tables` is given, array tables that need resolution are reconciled against the base
/// tables established so far, and resolved base tables are adopted.
pub fn parse(buffer: &[u8], mut tables: Option<&mut ArrayTables>) -> Result<ParsedBlob, Error> {
    let blob = ConfigBlob::from_bytes(buffer)?;

    let platform = if blob.header.is_merged() {
        FilePlatform::All
    } else {
        check_unique_tags(&blob.records)?;

        FilePlatform::Single(find_platform_id(&blob.records)?)
    };

    debug!(
        "Parsed blob header: {} records, {} bytes used, platform {:?}",
        blob.records.len(),
        blob.header.used_length,
        platform
    );

    let mut records = Vec::with_capacity(blob.records.len());

    for record in blob.records {
        let mask = match platform {
            FilePlatform::Single(id) => platform_bit(id),
            FilePlatform::All => record.conditions.first().copied().unwrap_or(ALL_PLATFORMS),
        };

        let reconciled = match (&record.payload, tables.as_mut()) {
            (Payload::Array(array), Some(tables)) => {
                let owner = match platform {
                    FilePlatform::Single(id) => id,
                    FilePlatform::All => first_platform(mask).unwrap_or(0),
                };

                Some(Payload::Array(tables.reconcile(record.tag, owner, array)?))
            }
            _ => None,
        };

        let record = match reconciled {
            Some(payload) => ConfigRecord { payload, ..record },
            None => record,
        };

        trace!("Record {:#05x} applies to {:#010x}", record.tag, mask);

        records.push(ParsedRecord { record, mask });
    }

    Ok(ParsedBlob {
        header: blob.header,
        platform,
        records,
    })
}
