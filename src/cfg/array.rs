//! Array table reconciliation
//!
//! The first per-platform table seen for a tag becomes the base table for that tag. Tables for
//! other platforms are reduced to the items that differ from the base, matched by the item
//! identity field rather than by position.
//!
//! Bitmask convention: in a base table, bit `i` is set when base item `i` carried its override
//! marker before the marker was cleared. In a delta table, bit `i` is set when base item `i` is
//! overridden by an item stored in the delta.

use std::collections::{BTreeMap, HashMap};

use log::{debug, trace};

use super::record::{ArrayPayload, BasePlatform};
use crate::error::{Error, SemanticError};

/// A base table and the platform that owns it
#[derive(Debug, Clone)]
struct BaseTable {
    owner: u8,
    array: ArrayPayload,
}

/// The base tables established while processing a set of files, keyed by tag
#[derive(Debug, Default)]
pub struct ArrayTables {
    bases: BTreeMap<u16, BaseTable>,
}

impl ArrayTables {
    pub fn new() -> ArrayTables {
        ArrayTables::default()
    }

    /// Returns the platform that owns the base table for `tag`, if one has been established
    pub fn base_owner(&self, tag: u16) -> Option<u8> {
        self.bases.get(&tag).map(|base| base.owner)
    }

    /// Registers an already resolved base table for `tag`, unless the tag has a base already
    pub fn adopt(&mut self, tag: u16, owner: u8, array: &ArrayPayload) {
        self.bases.entry(tag).or_insert_with(|| {
            debug!("Adopting base table for tag {:#05x} from platform {}", tag, owner);

            BaseTable {
                owner,
                array: array.clone(),
            }
        });
    }

    /// Reconciles the table `array` of `platform_id` for `tag`
    ///
    /// A table that needs resolution is either promoted to the base table for its tag, or
    /// reduced to a delta against the existing base. Tables that are already resolved are
    /// returned unchanged.
    pub fn reconcile(
        &mut self,
        tag: u16,
        platform_id: u8,
        array: &ArrayPayload,
    ) -> Result<ArrayPayload, Error> {
        match array.base {
            BasePlatform::NeedsResolution => {}
            BasePlatform::IsBase => {
                self.adopt(tag, platform_id, array);

                return Ok(array.clone());
            }
            BasePlatform::RefersTo(_) => return Ok(array.clone()),
        }

        if let Some(base) = self.bases.get(&tag) {
            if base.owner != platform_id {
                return delta(tag, base, array);
            }

            // The owner supplied the table again, it must match the base
            if promote(tag, array)? != base.array {
                return Err(SemanticError::ConflictingBaseTable(tag, platform_id).into());
            }

            return Ok(base.array.clone());
        }

        let promoted = promote(tag, array)?;

        debug!(
            "Platform {} owns the base table for tag {:#05x} ({} items)",
            platform_id,
            tag,
            promoted.items.len()
        );

        self.bases.insert(
            tag,
            BaseTable {
                owner: platform_id,
                array: promoted.clone(),
            },
        );

        Ok(promoted)
    }
}

/// Maps every item id of `array` to its index, failing on duplicates
fn index_items(tag: u16, array: &ArrayPayload) -> Result<HashMap<u64, usize>, SemanticError> {
    let mut index = HashMap::with_capacity(array.items.len());

    for (position, item) in array.items.iter().enumerate() {
        let id = array.item_id(item);

        if index.insert(id, position).is_some() {
            return Err(SemanticError::DuplicateItemId(tag, id));
        }
    }

    Ok(index)
}

/// Returns `true` if both tables share the item size and the field layout
fn same_layout(a: &ArrayPayload, b: &ArrayPayload) -> bool {
    a.item_size == b.item_size
        && a.id_bit_offset == b.id_bit_offset
        && a.id_bit_length == b.id_bit_length
        && a.valid_bit_offset == b.valid_bit_offset
}

/// Turns a full table into a base table
fn promote(tag: u16, array: &ArrayPayload) -> Result<ArrayPayload, Error> {
    index_items(tag, array)?;

    let mut base = ArrayPayload {
        base: BasePlatform::IsBase,
        bitmask: vec![0; array.bitmask.len()],
        items: Vec::with_capacity(array.items.len()),
        ..array.clone()
    };

    for (index, item) in array.items.iter().enumerate() {
        let mut item = item.clone();

        if array.has_marker(&item) {
            base.set_bitmask_bit(index);
            base.set_marker(&mut item, false);
        }

        base.items.push(item);
    }

    Ok(base)
}

/// Reduces `array` to the items that differ from `base`
fn delta(tag: u16, base: &BaseTable, array: &ArrayPayload) -> Result<ArrayPayload, Error> {
    if !same_layout(&base.array, array) || base.array.items.len() != array.items.len() {
        return Err(SemanticError::ArrayLayoutMismatch(tag).into());
    }

    index_items(tag, array)?;

    let base_index = index_items(tag, &base.array)?;
    let full_base = restore_base(&base.array);

    let mut delta = ArrayPayload {
        base: BasePlatform::RefersTo(base.owner),
        bitmask: vec![0; array.bitmask.len()],
        items: Vec::new(),
        ..array.clone()
    };

    for item in &array.items {
        let id = array.item_id(item);
        let index = *base_index
            .get(&id)
            .ok_or(SemanticError::UnknownItemId(tag, id))?;

        if *item != full_base.items[index] || array.has_marker(item) {
            trace!("Tag {:#05x} overrides item {:#x}", tag, id);

            delta.set_bitmask_bit(index);
            delta.items.push(item.clone());
        }
    }

    debug!(
        "Tag {:#05x} reduced from {} to {} items against platform {}",
        tag,
        array.items.len(),
        delta.items.len(),
        base.owner
    );

    Ok(delta)
}

/// Returns the full table of the platform that owns the base table `base`
///
/// The override markers recorded in the bitmask are put back on their items, the bitmask is
/// cleared and the table is marked as needing no further resolution.
pub fn restore_base(base: &ArrayPayload) -> ArrayPayload {
    let items = base
        .items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut item = item.clone();

            if base.bitmask_bit(index) {
                base.set_marker(&mut item, true);
            }

            item
        })
        .collect();

    ArrayPayload {
        base: BasePlatform::NeedsResolution,
        bitmask: vec![0; base.bitmask.len()],
        items,
        ..base.clone()
    }
}

/// Rebuilds a full table from the resolved table `base` and the delta table `delta`
pub fn reconstruct(
    tag: u16,
    base: &ArrayPayload,
    delta: &ArrayPayload,
) -> Result<ArrayPayload, Error> {
    if !same_layout(base, delta) {
        return Err(SemanticError::ArrayLayoutMismatch(tag).into());
    }

    let base_index = index_items(tag, base)?;
    let mut items = base.items.clone();

    for item in &delta.items {
        let id = delta.item_id(item);
        let index = *base_index
            .get(&id)
            .ok_or(SemanticError::UnknownItemId(tag, id))?;

        items[index] = item.clone();
    }

    Ok(ArrayPayload {
        base: BasePlatform::NeedsResolution,
        bitmask: vec![0; delta.bitmask.len()],
        items,
        ..delta.clone()
    })
}

#[cfg(test)]
mod tests {
    use assert_hex::*;

    use super::*;

    const TAG: u16 = 0x300;

    /// Builds a table of 8-byte items: id in byte 0, marker in bit 63, value in byte 4
    fn table(items: &[(u8, u8, bool)]) -> ArrayPayload {
        ArrayPayload {
            base: BasePlatform::NeedsResolution,
            item_size: 8,
            id_bit_offset: 0,
            id_bit_length: 8,
            valid_bit_offset: 63,
            unused: 0,
            bitmask: vec![0; 2],
            items: items
                .iter()
                .map(|&(id, value, marker)| {
                    vec![id, 0, 0, 0, value, 0, 0, if marker { 0x80 } else { 0 }]
                })
                .collect(),
        }
    }

    #[test]
    fn it_should_promote_first_table_to_base() {
        let mut tables = ArrayTables::new();
        let base = tables
            .reconcile(TAG, 2, &table(&[(1, 0x10, false), (2, 0x20, true)]))
            .unwrap();

        assert_eq!(base.base, BasePlatform::IsBase);
        assert_eq!(tables.base_owner(TAG), Some(2));
        assert_eq_hex!(base.bitmask, vec![0b10, 0]);
        assert!(!base.has_marker(&base.items[1]));
        assert_eq!(base.items.len(), 2);
    }

    #[test]
    fn it_should_reject_duplicate_item_ids() {
        let mut tables = ArrayTables::new();
        let result = tables.reconcile(TAG, 0, &table(&[(1, 0x10, false), (1, 0x20, false)]));

        assert!(matches!(
            result,
            Err(Error::Semantic(SemanticError::DuplicateItemId(TAG, 1)))
        ));
    }

    #[test]
    fn it_should_store_only_changed_items_in_delta() {
        let mut tables = ArrayTables::new();

        tables
            .reconcile(
                TAG,
                0,
                &table(&[(1, 0x10, false), (2, 0x20, false), (3, 0x30, false)]),
            )
            .unwrap();

        // Same items in a different order, item 3 changed
        let delta = tables
            .reconcile(
                TAG,
                4,
                &table(&[(3, 0x33, false), (1, 0x10, false), (2, 0x20, false)]),
            )
            .unwrap();

        assert_eq!(delta.base, BasePlatform::RefersTo(0));
        assert_eq!(delta.items.len(), 1);
        assert_eq!(delta.items[0][4], 0x33);
        assert_eq_hex!(delta.bitmask, vec![0b100, 0]);
        assert_eq!(delta.encoded_len() % 4, 0);
    }

    #[test]
    fn it_should_keep_marked_items_in_delta() {
        let mut tables = ArrayTables::new();

        tables
            .reconcile(TAG, 0, &table(&[(1, 0x10, false), (2, 0x20, false)]))
            .unwrap();

        let delta = tables
            .reconcile(TAG, 1, &table(&[(1, 0x10, true), (2, 0x20, false)]))
            .unwrap();

        assert_eq!(delta.items.len(), 1);
        assert!(delta.has_marker(&delta.items[0]));
        assert_eq_hex!(delta.bitmask, vec![0b01, 0]);
    }

    #[test]
    fn it_should_reject_item_missing_from_base() {
        let mut tables = ArrayTables::new();

        tables
            .reconcile(TAG, 0, &table(&[(1, 0x10, false), (2, 0x20, false)]))
            .unwrap();

        let result = tables.reconcile(TAG, 1, &table(&[(1, 0x10, false), (9, 0x20, false)]));

        assert!(matches!(
            result,
            Err(Error::Semantic(SemanticError::UnknownItemId(TAG, 9)))
        ));
    }

    #[test]
    fn it_should_reject_layout_mismatch() {
        let mut tables = ArrayTables::new();

        tables
            .reconcile(TAG, 0, &table(&[(1, 0x10, false), (2, 0x20, false)]))
            .unwrap();

        let result = tables.reconcile(TAG, 1, &table(&[(1, 0x10, false)]));

        assert!(matches!(
            result,
            Err(Error::Semantic(SemanticError::ArrayLayoutMismatch(TAG)))
        ));
    }

    #[test]
    fn it_should_reconstruct_original_tables() {
        let original_base = table(&[(1, 0x10, true), (2, 0x20, false), (3, 0x30, false)]);
        let original = table(&[(2, 0x21, false), (3, 0x30, true), (1, 0x10, true)]);

        let mut tables = ArrayTables::new();
        let base = tables.reconcile(TAG, 0, &original_base).unwrap();
        let delta = tables.reconcile(TAG, 1, &original).unwrap();

        let restored = restore_base(&base);
        assert_eq!(restored, original_base);

        let mut rebuilt = reconstruct(TAG, &restored, &delta).unwrap();
        let mut expected = original.items.clone();

        rebuilt.items.sort();
        expected.sort();

        assert_eq!(rebuilt.items, expected);
        assert_eq!(rebuilt.base, BasePlatform::NeedsResolution);
        assert_eq_hex!(rebuilt.bitmask, vec![0, 0]);
    }

    #[test]
    fn it_should_return_base_when_owner_supplies_table_again() {
        let mut tables = ArrayTables::new();
        let original = table(&[(1, 0x10, true), (2, 0x20, false)]);

        let first = tables.reconcile(TAG, 2, &original).unwrap();
        let second = tables.reconcile(TAG, 2, &original).unwrap();

        assert_eq!(second, first);
        assert_eq!(second.base, BasePlatform::IsBase);
    }

    #[test]
    fn it_should_reject_conflicting_table_from_owner() {
        let mut tables = ArrayTables::new();

        tables
            .reconcile(TAG, 2, &table(&[(1, 0x10, false), (2, 0x20, false)]))
            .unwrap();

        let result = tables.reconcile(TAG, 2, &table(&[(1, 0x11, false), (2, 0x20, false)]));

        assert!(matches!(
            result,
            Err(Error::Semantic(SemanticError::ConflictingBaseTable(TAG, 2)))
        ));
    }

    #[test]
    fn it_should_leave_resolved_tables_alone() {
        let mut tables = ArrayTables::new();
        let delta = ArrayPayload {
            base: BasePlatform::RefersTo(3),
            ..table(&[(1, 0x10, false)])
        };

        assert_eq!(tables.reconcile(TAG, 5, &delta).unwrap(), delta);
        assert_eq!(tables.base_owner(TAG), None);
    }
}
