//! Map a user-supplied name (kind, plural, singular, short name, `plural.group`)
//! to the resource type the server actually serves.

use std::sync::Arc;

use census_core::ResourceTypeDescriptor;
use tracing::debug;

use crate::context::RunContext;
use crate::discovery::{DiscoveryCache, DiscoveryMap};
use crate::error::EnumerateError;

#[derive(Debug, Clone)]
pub struct Resolver {
    cache: Arc<DiscoveryCache>,
}

impl Resolver {
    pub fn new(cache: Arc<DiscoveryCache>) -> Self {
        Self { cache }
    }

    /// Resolve `name` against the initialized discovery cache.
    pub fn resolve(&self, ctx: &RunContext, name: &str) -> Result<ResourceTypeDescriptor, EnumerateError> {
        if let Some(reason) = ctx.stop_reason() {
            return Err(EnumerateError::interrupted("resolve", reason));
        }
        let map = self.cache.get().ok_or(EnumerateError::NotInitialized)?;
        resolve_in(map, name)
    }
}

/// Kind first, then resource name re-derived to its kind.
pub fn resolve_in(map: &DiscoveryMap, name: &str) -> Result<ResourceTypeDescriptor, EnumerateError> {
    let name = name.trim();
    if let Some(t) = map.kind(name) {
        debug!(input = name, resource = %t.descriptor, "resolved as kind");
        return Ok(t.descriptor.clone());
    }
    let as_kind = format!("no served kind named {:?}", name);

    let as_resource = match map.kind_for_resource(name) {
        Some((group, kind)) => match map.group_kind(group, kind) {
            Some(t) => {
                debug!(input = name, kind, resource = %t.descriptor, "resolved as resource name");
                return Ok(t.descriptor.clone());
            }
            None => format!("resource maps to kind {:?} in group {:?}, which is not served", kind, group),
        },
        None => format!("no served resource named {:?}", name),
    };

    Err(EnumerateError::Unresolved { name: name.to_string(), as_kind, as_resource })
}
