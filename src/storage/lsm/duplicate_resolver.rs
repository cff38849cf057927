//! Version resolution for tuples sharing a key
//!
//! Resolvers receive every version of one key, newest first, and remove the
//! versions that should not survive. The order of the survivors is kept.

use crate::types::{now_micros, Tuple};

pub trait DuplicateResolver: Send + Sync {
    /// `versions` holds one key, sorted newest first
    fn resolve(&self, versions: &mut Vec<Tuple>);

    fn name(&self) -> &'static str;
}

/// Keep every version
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAllResolver;

impl DuplicateResolver for KeepAllResolver {
    fn resolve(&self, _versions: &mut Vec<Tuple>) {}

    fn name(&self) -> &'static str {
        "keep-all"
    }
}

/// Keep only the newest version (which may be a tombstone)
#[derive(Debug, Default, Clone, Copy)]
pub struct NewestVersionResolver;

impl DuplicateResolver for NewestVersionResolver {
    fn resolve(&self, versions: &mut Vec<Tuple>) {
        versions.truncate(1);
    }

    fn name(&self) -> &'static str {
        "newest-version"
    }
}

/// Keep at most `versions` versions that are younger than `ttl`
///
/// A zero `ttl_micros` disables expiry, zero `versions` disables the count
/// limit. The newest version always survives the TTL check so a key never
/// disappears without a tombstone.
#[derive(Debug, Clone, Copy)]
pub struct TtlAndVersionsResolver {
    ttl_micros: u64,
    versions: u32,
}

impl TtlAndVersionsResolver {
    pub fn new(ttl_micros: u64, versions: u32) -> Self {
        Self { ttl_micros, versions }
    }
}

impl DuplicateResolver for TtlAndVersionsResolver {
    fn resolve(&self, versions: &mut Vec<Tuple>) {
        if self.ttl_micros > 0 {
            // ttls beyond i64::MAX reach back past every version
            let ttl = i64::try_from(self.ttl_micros).unwrap_or(i64::MAX);
            let oldest_allowed = now_micros().saturating_sub(ttl);
            let mut position = 0;
            versions.retain(|t| {
                position += 1;
                position == 1 || t.version() >= oldest_allowed
            });
        }

        if self.versions > 0 {
            versions.truncate(self.versions as usize);
        }
    }

    fn name(&self) -> &'static str {
        "ttl-and-versions"
    }
}
