use std::convert::{TryFrom, TryInto};
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{PLATFORM_ID_TAG, SIGNATURE};
use crate::error::{CapacityError, Error, FormatError, SemanticError};

/// Size of the blob header in bytes
pub const BLOB_HEADER_SIZE: usize = 16;

/// Size of a tag header in bytes
pub const TAG_HEADER_SIZE: usize = 4;

/// Size of the fixed part of an array header in bytes, excluding the bitmask
pub const ARRAY_HEADER_SIZE: usize = 10;

/// Size of a condition word in bytes
const CONDITION_SIZE: usize = 4;

/// The largest record length in DWORDs that fits the tag header
const MAX_RECORD_DWORDS: usize = 0x3FF;

/// The most condition words a tag header can declare
const MAX_CONDITIONS: usize = 3;

/// Smallest bitmask an array header can carry
const MIN_BITMASK_LEN: usize = 2;

/// Returns `FormatError::MisalignedLength` if `len` is not a multiple of 4
pub(crate) fn ensure_aligned(what: &'static str, len: usize) -> Result<(), FormatError> {
    if len % 4 != 0 {
        return Err(FormatError::MisalignedLength(what, len));
    }

    Ok(())
}

/// Returns the `len` bytes at `offset` in `buf`, or `FormatError::TruncatedBuffer` if the buffer
/// is too short
pub(crate) fn slice_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], FormatError> {
    buf.get(offset..offset.saturating_add(len))
        .ok_or(FormatError::TruncatedBuffer {
            offset,
            needed: len,
            available: buf.len().saturating_sub(offset),
        })
}

/// The blob header at the start of every CFGDATA blob
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BlobHeader {
    /// Length of this header
    pub header_length: u8,
    /// Attribute flags, see `ATTR_SIGNED` and `ATTR_MERGED`
    pub attribute: u8,
    /// Security version number, carried through for the signing pipeline
    pub svn: u8,
    pub reserved: u8,
    /// Number of bytes in use, including this header
    pub used_length: u32,
    /// Number of bytes reserved for the blob
    pub total_length: u32,
}

impl BlobHeader {
    /// The blob has been signed
    pub const ATTR_SIGNED: u8 = 1 << 0;
    /// The blob is the output of a merge and its condition words are platform masks
    pub const ATTR_MERGED: u8 = 1 << 7;

    /// Returns a header with the given attributes and no records
    pub fn new(attribute: u8, svn: u8) -> BlobHeader {
        BlobHeader {
            header_length: BLOB_HEADER_SIZE as u8,
            attribute,
            svn,
            reserved: 0,
            used_length: BLOB_HEADER_SIZE as u32,
            total_length: BLOB_HEADER_SIZE as u32,
        }
    }

    pub fn is_merged(&self) -> bool {
        self.attribute & Self::ATTR_MERGED != 0
    }

    pub fn is_signed(&self) -> bool {
        self.attribute & Self::ATTR_SIGNED != 0
    }

    /// Reads and validates the blob header at the start of `buf`
    ///
    /// Besides the header fields themselves, this asserts that `buf` holds at least
    /// `used_length` bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let mut reader = Cursor::new(slice_at(buf, 0, BLOB_HEADER_SIZE)?);
        let mut signature = [0u8; 4];

        // Read the magic header
        reader.read_exact(&mut signature)?;

        if signature != SIGNATURE {
            return Err(FormatError::BadMagic(signature).into());
        }

        let header_length = reader.read_u8()?;
        let attribute = reader.read_u8()?;
        let svn = reader.read_u8()?;
        let reserved = reader.read_u8()?;
        let used_length = reader.read_u32::<LittleEndian>()?;
        let total_length = reader.read_u32::<LittleEndian>()?;

        if header_length as usize != BLOB_HEADER_SIZE {
            return Err(FormatError::BadHeaderLength(header_length).into());
        }

        ensure_aligned("used", used_length as usize)?;
        ensure_aligned("total", total_length as usize)?;

        if (used_length as usize) < BLOB_HEADER_SIZE || total_length < used_length {
            return Err(FormatError::LengthMismatch {
                consumed: used_length as usize,
                declared: total_length as usize,
            }
            .into());
        }

        // Assert that the whole used area is present
        slice_at(buf, 0, used_length as usize)?;

        Ok(BlobHeader {
            header_length,
            attribute,
            svn,
            reserved,
            used_length,
            total_length,
        })
    }

    /// Writes the blob header to the given `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        writer.write_all(&SIGNATURE)?;
        writer.write_u8(self.header_length)?;
        writer.write_u8(self.attribute)?;
        writer.write_u8(self.svn)?;
        writer.write_u8(self.reserved)?;
        writer.write_u32::<LittleEndian>(self.used_length)?;
        writer.write_u32::<LittleEndian>(self.total_length)?;

        Ok(())
    }
}

/// Selects the shape of a record payload
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum RecordType {
    Normal = 0,
    Array = 1,
    Reference = 2,
}

/// The packed 32-bit header in front of every record
///
/// ```text
///  31        20 19    16 15  12 11          2 1   0
/// +------------+--------+------+-------------+-----+
/// |    tag     |version | flags|   length    |conds|
/// +------------+--------+------+-------------+-----+
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TagHeader {
    /// Number of condition words following the header
    pub condition_count: u8,
    /// Length of the record in DWORDs, including this header
    pub length: u16,
    /// Record type selector in the low 2 bits
    pub flags: u8,
    pub version: u8,
    pub tag: u16,
}

impl TagHeader {
    const CONDITION_COUNT_SHIFT: u32 = 0;
    const CONDITION_COUNT_MASK: u32 = 0x3;
    const LENGTH_SHIFT: u32 = 2;
    const LENGTH_MASK: u32 = 0x3FF;
    const FLAGS_SHIFT: u32 = 12;
    const FLAGS_MASK: u32 = 0xF;
    const VERSION_SHIFT: u32 = 16;
    const VERSION_MASK: u32 = 0xF;
    const TAG_SHIFT: u32 = 20;
    const TAG_MASK: u32 = 0xFFF;

    /// Mask of the flag bits that select the record type
    const TYPE_MASK: u8 = 0x3;

    pub fn from_u32(value: u32) -> TagHeader {
        TagHeader {
            condition_count: ((value >> Self::CONDITION_COUNT_SHIFT) & Self::CONDITION_COUNT_MASK)
                as u8,
            length: ((value >> Self::LENGTH_SHIFT) & Self::LENGTH_MASK) as u16,
            flags: ((value >> Self::FLAGS_SHIFT) & Self::FLAGS_MASK) as u8,
            version: ((value >> Self::VERSION_SHIFT) & Self::VERSION_MASK) as u8,
            tag: ((value >> Self::TAG_SHIFT) & Self::TAG_MASK) as u16,
        }
    }

    pub fn to_u32(&self) -> u32 {
        ((self.condition_count as u32 & Self::CONDITION_COUNT_MASK) << Self::CONDITION_COUNT_SHIFT)
            | ((self.length as u32 & Self::LENGTH_MASK) << Self::LENGTH_SHIFT)
            | ((self.flags as u32 & Self::FLAGS_MASK) << Self::FLAGS_SHIFT)
            | ((self.version as u32 & Self::VERSION_MASK) << Self::VERSION_SHIFT)
            | ((self.tag as u32 & Self::TAG_MASK) << Self::TAG_SHIFT)
    }

    /// Returns the record type selected by the flags, if it is a known one
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::try_from(self.flags & Self::TYPE_MASK).ok()
    }

    /// Returns `true` if any flag bit outside the record type selector is set
    pub fn has_reserved_flags(&self) -> bool {
        self.flags & !Self::TYPE_MASK != 0
    }

    /// Length of the whole record in bytes
    pub fn byte_len(&self) -> usize {
        self.length as usize * 4
    }
}

/// The base platform field of an array header
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BasePlatform {
    /// The table is a resolved base table
    IsBase,
    /// The table is a full per-platform table that has not been reconciled yet
    NeedsResolution,
    /// The table is a delta against the base table owned by the given platform
    RefersTo(u8),
}

impl BasePlatform {
    const IS_BASE: u8 = 0x80;
    const NEEDS_RESOLUTION: u8 = 0xFF;

    pub fn from_u8(value: u8) -> Result<BasePlatform, SemanticError> {
        match value {
            Self::IS_BASE => Ok(BasePlatform::IsBase),
            Self::NEEDS_RESOLUTION => Ok(BasePlatform::NeedsResolution),
            id if id < Self::IS_BASE => Ok(BasePlatform::RefersTo(id)),
            other => Err(SemanticError::InvalidBasePlatform(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            BasePlatform::IsBase => Self::IS_BASE,
            BasePlatform::NeedsResolution => Self::NEEDS_RESOLUTION,
            BasePlatform::RefersTo(id) => id,
        }
    }
}

/// An array table with fixed-size items
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ArrayPayload {
    pub base: BasePlatform,
    /// Size of a single item in bytes
    pub item_size: u16,
    /// Bit offset of the item identity field inside an item
    pub id_bit_offset: u8,
    /// Bit length of the item identity field
    pub id_bit_length: u8,
    /// Bit offset of the per-item override marker inside an item
    pub valid_bit_offset: u8,
    pub unused: u8,
    /// One bit per base table item
    pub bitmask: Vec<u8>,
    pub items: Vec<Vec<u8>>,
}

impl ArrayPayload {
    /// Returns the smallest bitmask length that can describe `item_count` items
    pub fn min_bitmask_len(item_count: usize) -> usize {
        ((item_count + 7) / 8).max(MIN_BITMASK_LEN)
    }

    /// Size of the array header including the bitmask
    pub fn header_size(&self) -> usize {
        ARRAY_HEADER_SIZE + self.bitmask.len()
    }

    /// Size of the encoded array in bytes
    pub fn encoded_len(&self) -> usize {
        self.header_size() + self.items.len() * self.item_size as usize
    }

    /// Decodes an array payload from `bytes`, which must hold exactly the array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Cursor::new(slice_at(bytes, 0, ARRAY_HEADER_SIZE)?);

        let header_size = reader.read_u8()? as usize;
        let base = BasePlatform::from_u8(reader.read_u8()?)?;
        let item_size = reader.read_u16::<LittleEndian>()?;
        let item_count = reader.read_u16::<LittleEndian>()? as usize;
        let id_bit_offset = reader.read_u8()?;
        let id_bit_length = reader.read_u8()?;
        let valid_bit_offset = reader.read_u8()?;
        let unused = reader.read_u8()?;

        if header_size < ARRAY_HEADER_SIZE {
            return Err(CapacityError::InvalidArrayLayout("array header is too short").into());
        }

        let needed = header_size + item_count * item_size as usize;

        if bytes.len() < needed {
            return Err(CapacityError::ArrayDataTooSmall {
                needed,
                available: bytes.len(),
            }
            .into());
        } else if bytes.len() > needed {
            return Err(
                CapacityError::InvalidArrayLayout("trailing bytes after the array items").into(),
            );
        }

        let bitmask = bytes[ARRAY_HEADER_SIZE..header_size].to_vec();
        let items = if item_size == 0 {
            Vec::new()
        } else {
            bytes[header_size..]
                .chunks(item_size as usize)
                .map(|chunk| chunk.to_vec())
                .collect()
        };

        let array = ArrayPayload {
            base,
            item_size,
            id_bit_offset,
            id_bit_length,
            valid_bit_offset,
            unused,
            bitmask,
            items,
        };

        array.validate()?;

        Ok(array)
    }

    /// Checks the size and alignment constraints of the array
    pub fn validate(&self) -> Result<(), CapacityError> {
        let item_bits = self.item_size as usize * 8;

        if self.item_size == 0 || self.item_size % 4 != 0 {
            return Err(CapacityError::InvalidArrayLayout(
                "item size is not a non-zero multiple of 4",
            ));
        }

        if self.header_size() % 4 != 0 {
            return Err(CapacityError::InvalidArrayLayout(
                "array header size is not a multiple of 4",
            ));
        }

        if self.header_size() > u8::MAX as usize {
            return Err(CapacityError::InvalidArrayLayout("array bitmask is too large"));
        }

        if self.bitmask.len() < Self::min_bitmask_len(self.items.len()) {
            return Err(CapacityError::ArrayTooSmall {
                bitmask_len: self.bitmask.len(),
                item_count: self.items.len(),
            });
        }

        if self.id_bit_length == 0 || self.id_bit_length > 64 {
            return Err(CapacityError::InvalidArrayLayout(
                "item id must be between 1 and 64 bits wide",
            ));
        }

        if self.id_bit_offset as usize + self.id_bit_length as usize > item_bits {
            return Err(CapacityError::InvalidArrayLayout(
                "item id field is outside the item",
            ));
        }

        if self.valid_bit_offset as usize >= item_bits {
            return Err(CapacityError::InvalidArrayLayout(
                "item marker bit is outside the item",
            ));
        }

        Ok(())
    }

    /// Extracts the identity field of `item`
    pub fn item_id(&self, item: &[u8]) -> u64 {
        let offset = self.id_bit_offset as usize;

        (0..self.id_bit_length as usize).fold(0u64, |id, i| {
            let bit = offset + i;
            let value = (item[bit / 8] >> (bit % 8)) & 1;

            id | ((value as u64) << i)
        })
    }

    /// Returns `true` if the override marker of `item` is set
    pub fn has_marker(&self, item: &[u8]) -> bool {
        let bit = self.valid_bit_offset as usize;

        item[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Sets or clears the override marker of `item`
    pub fn set_marker(&self, item: &mut [u8], value: bool) {
        let bit = self.valid_bit_offset as usize;

        if value {
            item[bit / 8] |= 1 << (bit % 8);
        } else {
            item[bit / 8] &= !(1 << (bit % 8));
        }
    }

    /// Returns the bitmask bit for the base item at `index`
    pub fn bitmask_bit(&self, index: usize) -> bool {
        self.bitmask
            .get(index / 8)
            .map_or(false, |byte| byte & (1 << (index % 8)) != 0)
    }

    /// Sets the bitmask bit for the base item at `index`
    pub fn set_bitmask_bit(&mut self, index: usize) {
        if let Some(byte) = self.bitmask.get_mut(index / 8) {
            *byte |= 1 << (index % 8);
        }
    }

    /// Writes the encoded array to `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        self.validate()?;

        let item_count: u16 = self
            .items
            .len()
            .try_into()
            .map_err(|_| CapacityError::InvalidArrayLayout("too many items"))?;

        writer.write_u8(self.header_size() as u8)?;
        writer.write_u8(self.base.to_u8())?;
        writer.write_u16::<LittleEndian>(self.item_size)?;
        writer.write_u16::<LittleEndian>(item_count)?;
        writer.write_u8(self.id_bit_offset)?;
        writer.write_u8(self.id_bit_length)?;
        writer.write_u8(self.valid_bit_offset)?;
        writer.write_u8(self.unused)?;
        writer.write_all(&self.bitmask)?;

        for item in &self.items {
            if item.len() != self.item_size as usize {
                return Err(CapacityError::InvalidArrayLayout("item has the wrong size").into());
            }

            writer.write_all(item)?;
        }

        Ok(())
    }
}

/// A record whose value is the value of another tag on another platform
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Reference {
    /// The platform to resolve `tag` for
    pub platform_id: u16,
    /// The target tag
    pub tag: u16,
    /// Whether the target lives in the internal (built-in) store
    pub is_internal: bool,
}

impl Reference {
    const ENCODED_LEN: usize = 4;
    const TAG_MASK: u16 = 0x0FFF;
    const INTERNAL_BIT: u16 = 1 << 12;

    pub fn from_bytes(tag: u16, bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(FormatError::BadPayloadLength(tag, bytes.len()).into());
        }

        let mut reader = Cursor::new(bytes);
        let platform_id = reader.read_u16::<LittleEndian>()?;
        let word = reader.read_u16::<LittleEndian>()?;

        Ok(Reference {
            platform_id,
            tag: word & Self::TAG_MASK,
            is_internal: word & Self::INTERNAL_BIT != 0,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        let mut word = self.tag & Self::TAG_MASK;

        if self.is_internal {
            word |= Self::INTERNAL_BIT;
        }

        writer.write_u16::<LittleEndian>(self.platform_id)?;
        writer.write_u16::<LittleEndian>(word)?;

        Ok(())
    }
}

/// The payload of a record, selected by the record type and tag
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    Normal(Vec<u8>),
    PlatformId { id: u16, reserved: u16 },
    Array(ArrayPayload),
    Reference(Reference),
}

impl Payload {
    pub fn record_type(&self) -> RecordType {
        match self {
            Payload::Normal(_) | Payload::PlatformId { .. } => RecordType::Normal,
            Payload::Array(_) => RecordType::Array,
            Payload::Reference(_) => RecordType::Reference,
        }
    }

    /// Size of the encoded payload in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Payload::Normal(data) => data.len(),
            Payload::PlatformId { .. } | Payload::Reference(_) => 4,
            Payload::Array(array) => array.encoded_len(),
        }
    }

    /// Decodes the payload of a record with the given `tag` and `record_type`
    pub fn from_bytes(tag: u16, record_type: RecordType, bytes: &[u8]) -> Result<Self, Error> {
        match record_type {
            RecordType::Normal if tag == PLATFORM_ID_TAG => {
                if bytes.len() != 4 {
                    return Err(FormatError::BadPayloadLength(tag, bytes.len()).into());
                }

                let mut reader = Cursor::new(bytes);
                let id = reader.read_u16::<LittleEndian>()?;
                let reserved = reader.read_u16::<LittleEndian>()?;

                Ok(Payload::PlatformId { id, reserved })
            }
            RecordType::Normal => Ok(Payload::Normal(bytes.to_vec())),
            RecordType::Array => Ok(Payload::Array(ArrayPayload::from_bytes(bytes)?)),
            RecordType::Reference => Ok(Payload::Reference(Reference::from_bytes(tag, bytes)?)),
        }
    }

    /// Encodes the payload into a new byte vector
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        match self {
            Payload::Normal(data) => buf.extend_from_slice(data),
            Payload::PlatformId { id, reserved } => {
                buf.write_u16::<LittleEndian>(*id)?;
                buf.write_u16::<LittleEndian>(*reserved)?;
            }
            Payload::Array(array) => array.write_to(&mut buf)?,
            Payload::Reference(reference) => reference.write_to(&mut buf)?,
        }

        Ok(buf)
    }
}

/// A single tagged record of a blob
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConfigRecord {
    pub tag: u16,
    pub version: u8,
    /// Condition words; in a merged blob the first one is the platform mask
    pub conditions: Vec<u32>,
    pub payload: Payload,
}

impl ConfigRecord {
    /// Decodes the record starting at `offset` in `buf`, returning it together with its encoded
    /// length
    pub fn from_bytes(buf: &[u8], offset: usize) -> Result<(Self, usize), Error> {
        let word = slice_at(buf, offset, TAG_HEADER_SIZE)?;
        let header = TagHeader::from_u32(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        let len = header.byte_len();
        let payload_offset = TAG_HEADER_SIZE + header.condition_count as usize * CONDITION_SIZE;

        if len < payload_offset {
            return Err(FormatError::BadRecordLength(offset, len).into());
        }

        if header.has_reserved_flags() {
            return Err(FormatError::ReservedFlags(offset, header.flags).into());
        }

        let record_type = header
            .record_type()
            .ok_or(FormatError::UnknownRecordType(offset, header.flags))?;
        let bytes = slice_at(buf, offset, len)?;

        let mut reader = Cursor::new(&bytes[TAG_HEADER_SIZE..payload_offset]);
        let conditions = (0..header.condition_count)
            .map(|_| reader.read_u32::<LittleEndian>())
            .collect::<Result<Vec<_>, _>>()?;

        let payload = Payload::from_bytes(header.tag, record_type, &bytes[payload_offset..])?;

        Ok((
            ConfigRecord {
                tag: header.tag,
                version: header.version,
                conditions,
                payload,
            },
            len,
        ))
    }

    /// Builds the tag header for this record given the encoded payload length
    fn tag_header(&self, payload_len: usize) -> Result<TagHeader, FormatError> {
        ensure_aligned("payload", payload_len)?;

        if self.conditions.len() > MAX_CONDITIONS {
            return Err(FormatError::TooManyConditions(
                self.tag,
                self.conditions.len(),
            ));
        }

        let len = TAG_HEADER_SIZE + self.conditions.len() * CONDITION_SIZE + payload_len;

        if len / 4 > MAX_RECORD_DWORDS {
            return Err(FormatError::RecordTooLarge(self.tag, len));
        }

        Ok(TagHeader {
            condition_count: self.conditions.len() as u8,
            length: (len / 4) as u16,
            flags: self.payload.record_type().into(),
            version: self.version,
            tag: self.tag,
        })
    }

    /// Writes the encoded record to `writer`, returning the number of bytes written
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        let payload = self.payload.to_bytes()?;
        let header = self.tag_header(payload.len())?;

        writer.write_u32::<LittleEndian>(header.to_u32())?;

        for condition in &self.conditions {
            writer.write_u32::<LittleEndian>(*condition)?;
        }

        writer.write_all(&payload)?;

        Ok(header.byte_len())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        self.write_to(&mut buf)?;

        Ok(buf)
    }
}

/// A complete blob: header and record stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConfigBlob {
    pub header: BlobHeader,
    pub records: Vec<ConfigRecord>,
}

impl ConfigBlob {
    /// Decodes the header and the whole record stream of `buf`
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let header = BlobHeader::from_bytes(buf)?;
        let used = header.used_length as usize;
        let mut offset = header.header_length as usize;
        let mut records = Vec::new();

        while offset < used {
            let word = slice_at(buf, offset, TAG_HEADER_SIZE)?;
            let declared =
                TagHeader::from_u32(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
                    .byte_len();

            if offset + declared > used {
                return Err(FormatError::LengthMismatch {
                    consumed: offset + declared,
                    declared: used,
                }
                .into());
            }

            let (record, len) = ConfigRecord::from_bytes(&buf[..used], offset)?;

            records.push(record);
            offset += len;
        }

        if offset != used {
            return Err(FormatError::LengthMismatch {
                consumed: offset,
                declared: used,
            }
            .into());
        }

        Ok(ConfigBlob { header, records })
    }

    /// Encodes the blob, recomputing the used length from the records
    ///
    /// The total length is kept if it is large enough to hold the records, otherwise it grows to
    /// the used length.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();

        for record in &self.records {
            record.write_to(&mut body)?;
        }

        let used_length = u32::try_from(BLOB_HEADER_SIZE + body.len())
            .map_err(|_| FormatError::BlobTooLarge(BLOB_HEADER_SIZE + body.len()))?;
        let header = BlobHeader {
            header_length: BLOB_HEADER_SIZE as u8,
            used_length,
            total_length: self.header.total_length.max(used_length),
            ..self.header
        };

        let mut buf = Vec::with_capacity(used_length as usize);

        header.write_to(&mut buf)?;
        buf.extend_from_slice(&body);

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use assert_hex::*;
    use hex_literal::hex;

    use super::*;

    /// An unmerged blob for platform 3 with a platform id record and one normal record
    const PLATFORM_3_BLOB: [u8; 36] = hex!(
        "43 46 47 44 10 00 01 00 24 00 00 00 24 00 00 00"
        "08 00 00 0F 03 00 00 00"
        "0C 00 00 10 BB AA 00 00 44 33 22 11"
    );

    fn array_fixture() -> ArrayPayload {
        ArrayPayload {
            base: BasePlatform::NeedsResolution,
            item_size: 4,
            id_bit_offset: 0,
            id_bit_length: 8,
            valid_bit_offset: 31,
            unused: 0,
            bitmask: vec![0, 0],
            items: vec![vec![1, 0xAA, 0, 0], vec![2, 0xBB, 0, 0x80]],
        }
    }

    #[test]
    fn it_should_unpack_tag_header_fields() {
        let header = TagHeader::from_u32(0x1001_100D);

        assert_eq!(header.condition_count, 1);
        assert_eq!(header.length, 3);
        assert_eq!(header.flags, 1);
        assert_eq!(header.version, 1);
        assert_eq!(header.tag, 0x100);
        assert_eq!(header.record_type(), Some(RecordType::Array));
        assert_eq_hex!(header.to_u32(), 0x1001_100D);
    }

    #[test]
    fn it_should_reject_unknown_record_type() {
        let header = TagHeader::from_u32(0x1000_3004);

        assert_eq!(header.record_type(), None);
    }

    #[test]
    fn it_should_read_blob_header() {
        let header = BlobHeader::from_bytes(&PLATFORM_3_BLOB).unwrap();

        assert_eq!(header.header_length, 16);
        assert!(header.is_signed());
        assert!(!header.is_merged());
        assert_eq!(header.used_length, 36);
        assert_eq!(header.total_length, 36);
    }

    #[test]
    fn it_should_reject_bad_magic() {
        let mut buf = PLATFORM_3_BLOB;
        buf[0..4].copy_from_slice(b"CFGX");

        match BlobHeader::from_bytes(&buf) {
            Err(Error::Format(FormatError::BadMagic(magic))) => assert_eq!(&magic, b"CFGX"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn it_should_reject_misaligned_used_length() {
        let mut buf = PLATFORM_3_BLOB;
        buf[8] = 0x22;

        assert!(matches!(
            BlobHeader::from_bytes(&buf),
            Err(Error::Format(FormatError::MisalignedLength("used", 0x22)))
        ));
    }

    #[test]
    fn it_should_reject_truncated_buffer() {
        assert!(matches!(
            BlobHeader::from_bytes(&PLATFORM_3_BLOB[..32]),
            Err(Error::Format(FormatError::TruncatedBuffer { .. }))
        ));
    }

    #[test]
    fn it_should_decode_records() {
        let blob = ConfigBlob::from_bytes(&PLATFORM_3_BLOB).unwrap();

        assert_eq!(blob.records.len(), 2);
        assert_eq!(
            blob.records[0].payload,
            Payload::PlatformId { id: 3, reserved: 0 }
        );
        assert_eq!(blob.records[1].tag, 0x100);
        assert!(blob.records[1].conditions.is_empty());
        assert_eq!(
            blob.records[1].payload,
            Payload::Normal(hex!("BB AA 00 00 44 33 22 11").to_vec())
        );
    }

    #[test]
    fn it_should_round_trip_blob() {
        let blob = ConfigBlob::from_bytes(&PLATFORM_3_BLOB).unwrap();

        assert_eq_hex!(blob.to_bytes().unwrap(), PLATFORM_3_BLOB.to_vec());
    }

    #[test]
    fn it_should_keep_reserved_header_byte() {
        let mut buf = PLATFORM_3_BLOB;
        buf[7] = 0x5A;

        let blob = ConfigBlob::from_bytes(&buf).unwrap();

        assert_eq!(blob.header.reserved, 0x5A);
        assert_eq_hex!(blob.to_bytes().unwrap(), buf.to_vec());
    }

    #[test]
    fn it_should_reject_reserved_flag_bits() {
        let mut buf = PLATFORM_3_BLOB;
        // Set flag bit 2 of the record at offset 24
        buf[25] = 0x40;

        assert!(matches!(
            ConfigBlob::from_bytes(&buf),
            Err(Error::Format(FormatError::ReservedFlags(24, 0x4)))
        ));
    }

    #[test]
    fn it_should_round_trip_array_and_reference_records() {
        let records = vec![
            ConfigRecord {
                tag: 0x200,
                version: 2,
                conditions: vec![0x28],
                payload: Payload::Array(array_fixture()),
            },
            ConfigRecord {
                tag: 0x201,
                version: 0,
                conditions: vec![0x01],
                payload: Payload::Reference(Reference {
                    platform_id: 5,
                    tag: 0x200,
                    is_internal: true,
                }),
            },
        ];
        let blob = ConfigBlob {
            header: BlobHeader::new(BlobHeader::ATTR_MERGED, 7),
            records,
        };

        let bytes = blob.to_bytes().unwrap();
        let decoded = ConfigBlob::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.records, blob.records);
        assert_eq!(decoded.header.svn, 7);
        assert_eq!(decoded.header.used_length as usize, bytes.len());
        assert_eq_hex!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn it_should_encode_reference_internal_bit() {
        let reference = Reference {
            platform_id: 2,
            tag: 0x123,
            is_internal: true,
        };
        let bytes = Payload::Reference(reference).to_bytes().unwrap();

        assert_eq_hex!(bytes, hex!("02 00 23 11").to_vec());
    }

    #[test]
    fn it_should_extract_item_id_across_bytes() {
        let array = ArrayPayload {
            id_bit_offset: 4,
            id_bit_length: 8,
            ..array_fixture()
        };

        assert_eq_hex!(array.item_id(&[0xA0, 0x0B, 0, 0]), 0xBA);
    }

    #[test]
    fn it_should_reject_small_bitmask() {
        let array = ArrayPayload {
            bitmask: vec![0],
            ..array_fixture()
        };

        assert!(matches!(
            array.validate(),
            Err(CapacityError::InvalidArrayLayout(_))
        ));

        let array = ArrayPayload {
            bitmask: vec![0; 2],
            items: vec![vec![0; 4]; 17],
            ..array_fixture()
        };

        assert_eq!(
            array.validate(),
            Err(CapacityError::ArrayTooSmall {
                bitmask_len: 2,
                item_count: 17
            })
        );
    }

    #[test]
    fn it_should_reject_array_with_missing_items() {
        let mut bytes = Vec::new();
        array_fixture().write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 4);

        assert!(matches!(
            ArrayPayload::from_bytes(&bytes),
            Err(Error::Capacity(CapacityError::ArrayDataTooSmall { .. }))
        ));
    }

    #[test]
    fn it_should_reject_invalid_base_platform() {
        assert_eq!(
            BasePlatform::from_u8(0x90),
            Err(SemanticError::InvalidBasePlatform(0x90))
        );
        assert_eq!(BasePlatform::from_u8(0x05), Ok(BasePlatform::RefersTo(5)));
    }
}
