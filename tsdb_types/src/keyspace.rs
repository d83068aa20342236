//! Mapping from retention periods to physical keyspaces.
use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("default ttl of {0} days is not mapped to a keyspace")]
    DefaultTtlNotMapped(u32),

    #[error("ttl must be a positive number of days")]
    ZeroTtl,

    #[error("keyspace for ttl {0} has an empty name")]
    EmptyKeyspace(u32),

    #[error("ttl {ttl} is mapped to both {first:?} and {second:?}")]
    DuplicateTtl {
        ttl: u32,
        first: String,
        second: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read-only lookup of TTL (days) to physical keyspace name.
///
/// Built once at startup and shared by every component. A lookup for a TTL
/// that has no keyspace falls back to the default TTL, which is guaranteed to
/// be mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceTtlMap {
    keyspaces: BTreeMap<u32, String>,
    default_ttl: u32,
}

impl KeyspaceTtlMap {
    pub fn try_new<I, S>(mappings: I, default_ttl: u32) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let mut keyspaces: BTreeMap<u32, String> = BTreeMap::new();
        for (ttl, keyspace) in mappings {
            let keyspace = keyspace.into();
            if ttl == 0 {
                return Err(Error::ZeroTtl);
            }
            if keyspace.is_empty() {
                return Err(Error::EmptyKeyspace(ttl));
            }
            if let Some(first) = keyspaces.get(&ttl) {
                if *first != keyspace {
                    return Err(Error::DuplicateTtl {
                        ttl,
                        first: first.clone(),
                        second: keyspace,
                    });
                }
            }
            keyspaces.insert(ttl, keyspace);
        }

        if !keyspaces.contains_key(&default_ttl) {
            return Err(Error::DefaultTtlNotMapped(default_ttl));
        }

        Ok(Self {
            keyspaces,
            default_ttl,
        })
    }

    pub fn default_ttl(&self) -> u32 {
        self.default_ttl
    }

    /// The keyspace configured for exactly `ttl`, if any.
    pub fn keyspace(&self, ttl: u32) -> Option<&str> {
        self.keyspaces.get(&ttl).map(String::as_str)
    }

    /// Resolve an optional TTL to the TTL actually used and its keyspace.
    pub fn resolve(&self, ttl: Option<u32>) -> (u32, &str) {
        if let Some(ttl) = ttl {
            if let Some(keyspace) = self.keyspace(ttl) {
                return (ttl, keyspace);
            }
        }
        let keyspace = self
            .keyspaces
            .get(&self.default_ttl)
            .map(String::as_str)
            .unwrap_or_default();
        (self.default_ttl, keyspace)
    }
}
