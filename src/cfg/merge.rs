use log::{debug, info, trace};

use super::array::ArrayTables;
use super::parser::{parse, FilePlatform, ParsedBlob};
use super::record::{BasePlatform, BlobHeader, ConfigBlob, ConfigRecord, Payload, Reference};
use super::{first_platform, ALL_PLATFORMS, MAX_PLATFORM_ID, PLATFORM_ID_TAG};
use crate::error::{Error, SemanticError};

/// Payloads up to this size are stored again rather than aliased
const MIN_ALIAS_LEN: usize = 4;

/// An input file registered with a `MergeEngine`
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Name used to identify the file in messages
    pub name: String,
    pub blob: ParsedBlob,
    /// Whether the file is a pre-signed built-in blob
    pub builtin: bool,
}

impl SourceFile {
    pub fn platform(&self) -> FilePlatform {
        self.blob.platform
    }
}

/// Options for `MergeEngine::create`
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CreateOptions {
    /// Platform id to write into the platform id record of the output
    pub platform_id: Option<u8>,
    /// Security version number of the output, defaults to the highest input svn
    pub svn: Option<u8>,
}

/// A canonical record of the merge result
#[derive(Debug, Clone)]
struct MergedItem {
    tag: u16,
    version: u8,
    payload: Payload,
    /// Every platform that resolves to this payload
    mask: u32,
    /// The platforms of the first contribution
    first_mask: u32,
    builtin: bool,
    /// Index of the item whose identical payload this item refers to
    alias: Option<usize>,
}

impl MergedItem {
    /// The platforms the stored payload is emitted for
    fn stored_mask(&self) -> u32 {
        if self.builtin {
            self.first_mask
        } else {
            self.mask
        }
    }

    fn to_record(&self, mask: u32) -> ConfigRecord {
        ConfigRecord {
            tag: self.tag,
            version: self.version,
            conditions: vec![mask],
            payload: self.payload.clone(),
        }
    }
}

/// Returns `true` if a payload can be shared between different tags
///
/// Delta tables are relative to the base table of their own tag, so they cannot stand in for
/// another tag.
fn can_alias(payload: &Payload) -> bool {
    match payload {
        Payload::Normal(_) => true,
        Payload::Array(array) => !matches!(array.base, BasePlatform::RefersTo(_)),
        Payload::PlatformId { .. } | Payload::Reference(_) => false,
    }
}

fn reference_record(
    tag: u16,
    version: u8,
    mask: u32,
    target: &MergedItem,
    platform_mask: u32,
) -> ConfigRecord {
    ConfigRecord {
        tag,
        version,
        conditions: vec![mask],
        payload: Payload::Reference(Reference {
            platform_id: first_platform(platform_mask).unwrap_or(0) as u16,
            tag: target.tag,
            is_internal: target.builtin,
        }),
    }
}

/// The canonical record list of one merge run
#[derive(Debug, Default)]
struct MergedSet {
    items: Vec<MergedItem>,
    /// Index of the platform id placeholder
    platform_slot: Option<usize>,
}

impl MergedSet {
    /// Folds `record`, which applies to the platforms in `mask`, into the set
    fn merge(&mut self, record: &ConfigRecord, mask: u32, builtin: bool) {
        if let Payload::PlatformId { .. } = record.payload {
            if self.platform_slot.is_none() {
                self.platform_slot = Some(self.items.len());
                self.items.push(MergedItem {
                    tag: PLATFORM_ID_TAG,
                    version: record.version,
                    payload: Payload::PlatformId { id: 0, reserved: 0 },
                    mask: 0,
                    first_mask: 0,
                    builtin: false,
                    alias: None,
                });
            }

            return;
        }

        if let Some(item) = self.items.iter_mut().find(|item| {
            item.tag == record.tag
                && item.version == record.version
                && item.payload == record.payload
        }) {
            trace!(
                "Tag {:#05x} shared by {:#010x} and {:#010x}",
                record.tag,
                item.mask,
                mask
            );

            item.mask |= mask;

            return;
        }

        let alias = if !builtin
            && record.payload.encoded_len() > MIN_ALIAS_LEN
            && can_alias(&record.payload)
        {
            self.items.iter().position(|item| {
                item.alias.is_none()
                    && item.tag != PLATFORM_ID_TAG
                    && item.payload == record.payload
            })
        } else {
            None
        };

        if let Some(target) = alias {
            debug!(
                "Tag {:#05x} has the same payload as tag {:#05x}",
                record.tag, self.items[target].tag
            );
        }

        self.items.push(MergedItem {
            tag: record.tag,
            version: record.version,
            payload: record.payload.clone(),
            mask,
            first_mask: mask,
            builtin,
            alias,
        });
    }

    /// Serializes the canonical items into records
    fn into_records(self, platform_id: Option<u8>) -> Vec<ConfigRecord> {
        let mut records = Vec::with_capacity(self.items.len() + 1);

        let platform_record = |version: u8| {
            let (id, condition) = match platform_id {
                Some(id) => (id as u16, ALL_PLATFORMS),
                None => (0, 0),
            };

            ConfigRecord {
                tag: PLATFORM_ID_TAG,
                version,
                conditions: vec![condition],
                payload: Payload::PlatformId { id, reserved: 0 },
            }
        };

        if self.platform_slot.is_none() && platform_id.is_some() {
            records.push(platform_record(0));
        }

        for (index, item) in self.items.iter().enumerate() {
            if Some(index) == self.platform_slot {
                records.push(platform_record(item.version));
            } else if let Some(target) = item.alias {
                let target = &self.items[target];

                records.push(reference_record(
                    item.tag,
                    item.version,
                    item.mask,
                    target,
                    target.stored_mask(),
                ));
            } else if item.builtin && item.mask != item.first_mask {
                // The built-in payload keeps its original platforms, the rest refer to it
                records.push(item.to_record(item.first_mask));
                records.push(reference_record(
                    item.tag,
                    item.version,
                    item.mask & !item.first_mask,
                    item,
                    item.first_mask,
                ));
            } else {
                records.push(item.to_record(item.mask));
            }
        }

        records
    }
}

/// Merges the records of several blobs into a single blob
///
/// Files are merged in the order they were added. The engine owns the array base tables
/// established while parsing, so a fresh engine is needed for every output.
#[derive(Debug, Default)]
pub struct MergeEngine {
    files: Vec<SourceFile>,
    tables: ArrayTables,
}

impl MergeEngine {
    pub fn new() -> MergeEngine {
        MergeEngine::default()
    }

    /// Parses `buffer` and registers it under `name`
    ///
    /// Array tables are reconciled against the base tables of previously added files.
    pub fn add_file<S: Into<String>>(
        &mut self,
        name: S,
        buffer: &[u8],
        builtin: bool,
    ) -> Result<&SourceFile, Error> {
        let name = name.into();
        let blob = parse(buffer, Some(&mut self.tables))?;

        info!(
            "Loaded {}{}: {} records for {:?}",
            name,
            if builtin { " (built-in)" } else { "" },
            blob.records.len(),
            blob.platform
        );

        self.files.push(SourceFile {
            name,
            blob,
            builtin,
        });

        Ok(&self.files[self.files.len() - 1])
    }

    /// Returns the registered files in insertion order
    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    /// Merges every registered file into a new blob
    pub fn create(&self, options: CreateOptions) -> Result<ConfigBlob, Error> {
        if let Some(id) = options.platform_id {
            if id > MAX_PLATFORM_ID {
                return Err(SemanticError::NoSuchPlatform(id).into());
            }
        }

        let mut set = MergedSet::default();

        for file in &self.files {
            debug!("Merging {}", file.name);

            for parsed in &file.blob.records {
                set.merge(&parsed.record, parsed.mask, file.builtin);
            }
        }

        let svn = options.svn.unwrap_or_else(|| {
            self.files
                .iter()
                .map(|file| file.blob.header.svn)
                .max()
                .unwrap_or(0)
        });

        let records = set.into_records(options.platform_id);

        info!(
            "Merged {} files into {} records",
            self.files.len(),
            records.len()
        );

        Ok(ConfigBlob {
            header: BlobHeader::new(BlobHeader::ATTR_MERGED, svn),
            records,
        })
    }
}
