use log::trace;

use super::array::{reconstruct, restore_base};
use super::parser::ParsedBlob;
use super::record::{BasePlatform, Payload};
use super::MAX_PLATFORM_ID;
use crate::error::{Error, SemanticError};

/// How many references or base tables may be followed for a single lookup
const MAX_RESOLVE_DEPTH: usize = 8;

/// Resolves the effective value of a tag for a platform
///
/// Lookups search the external blob first and fall back to the internal (built-in) blob.
/// References that point into the internal blob search it first instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver<'a> {
    internal: Option<&'a ParsedBlob>,
    external: Option<&'a ParsedBlob>,
}

impl<'a> Resolver<'a> {
    pub fn new(internal: Option<&'a ParsedBlob>, external: Option<&'a ParsedBlob>) -> Self {
        Resolver { internal, external }
    }

    /// Returns a resolver over a single blob
    pub fn single(blob: &'a ParsedBlob) -> Self {
        Resolver {
            internal: None,
            external: Some(blob),
        }
    }

    /// Resolves `tag` for `platform_id`
    ///
    /// References are followed and delta array tables are rebuilt into full tables, so the
    /// result never needs further resolution.
    pub fn resolve(&self, platform_id: u8, tag: u16) -> Result<Payload, Error> {
        if platform_id > MAX_PLATFORM_ID {
            return Err(SemanticError::NoSuchPlatform(platform_id).into());
        }

        self.resolve_in(false, platform_id, tag, 0)
    }

    fn resolve_in(
        &self,
        prefer_internal: bool,
        platform_id: u8,
        tag: u16,
        depth: usize,
    ) -> Result<Payload, Error> {
        if depth > MAX_RESOLVE_DEPTH {
            return Err(SemanticError::ReferenceLoop(tag).into());
        }

        let stores = if prefer_internal {
            [self.internal, self.external]
        } else {
            [self.external, self.internal]
        };

        for store in stores.iter().flatten() {
            if let Some(parsed) = store.find(tag, platform_id) {
                trace!(
                    "Found tag {:#05x} for platform {} with mask {:#010x}",
                    tag,
                    platform_id,
                    parsed.mask
                );

                return self.expand(&parsed.record.payload, platform_id, tag, depth);
            }
        }

        Err(Error::TagNotFound { tag, platform_id })
    }

    fn expand(
        &self,
        payload: &Payload,
        platform_id: u8,
        tag: u16,
        depth: usize,
    ) -> Result<Payload, Error> {
        match payload {
            Payload::Reference(reference) => {
                if reference.platform_id > MAX_PLATFORM_ID as u16 {
                    return Err(SemanticError::InvalidPlatformId(reference.platform_id).into());
                }

                trace!(
                    "Tag {:#05x} refers to tag {:#05x} of platform {}",
                    tag,
                    reference.tag,
                    reference.platform_id
                );

                self.resolve_in(
                    reference.is_internal,
                    reference.platform_id as u8,
                    reference.tag,
                    depth + 1,
                )
            }
            Payload::Array(array) => match array.base {
                BasePlatform::NeedsResolution => Ok(payload.clone()),
                BasePlatform::IsBase => Ok(Payload::Array(restore_base(array))),
                BasePlatform::RefersTo(base_id) => {
                    let base = match self.resolve_in(false, base_id, tag, depth + 1)? {
                        Payload::Array(base) => base,
                        _ => return Err(SemanticError::ArrayLayoutMismatch(tag).into()),
                    };

                    Ok(Payload::Array(reconstruct(tag, &base, array)?))
                }
            },
            _ => Ok(payload.clone()),
        }
    }
}
