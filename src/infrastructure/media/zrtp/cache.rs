//! ZID cache: local identity plus retained secrets of previously seen peers

use super::kdf::Zid;
use crate::domain::shared::{DomainError, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSecret {
    pub rs1: Vec<u8>,
    /// SAS was confirmed by a human at least once
    pub verified: bool,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedSecret {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntryFile {
    rs1: String,
    verified: bool,
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    local_zid: String,
    entries: HashMap<String, CacheEntryFile>,
}

fn parse_zid(value: &str) -> Option<Zid> {
    let bytes = hex::decode(value).ok()?;
    bytes.try_into().ok()
}

pub struct ZidCache {
    local_zid: Zid,
    entries: RwLock<HashMap<Zid, CachedSecret>>,
    ttl: RwLock<Duration>,
    path: Option<PathBuf>,
}

impl ZidCache {
    /// In-memory cache with a fresh ZID
    pub fn ephemeral(ttl: Duration) -> Self {
        Self {
            local_zid: Self::generate_zid(),
            entries: RwLock::new(HashMap::new()),
            ttl: RwLock::new(ttl),
            path: None,
        }
    }

    /// Load the cache file, creating a new identity when it does not exist
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        if !path.exists() {
            info!("ZRTP cache {} not found, creating new identity", path.display());
            let cache = Self {
                path: Some(path.to_path_buf()),
                ..Self::ephemeral(ttl)
            };
            cache.persist()?;
            return Ok(cache);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| DomainError::Internal(format!("Read {}: {}", path.display(), e)))?;
        let file: CacheFile = serde_json::from_str(&raw).map_err(|e| {
            DomainError::ValidationError(format!("Corrupt ZRTP cache {}: {}", path.display(), e))
        })?;

        let local_zid = parse_zid(&file.local_zid).ok_or_else(|| {
            DomainError::ValidationError(format!("Invalid local ZID in {}", path.display()))
        })?;

        let mut entries = HashMap::new();
        for (peer, entry) in file.entries {
            let (Some(zid), Ok(rs1)) = (parse_zid(&peer), hex::decode(&entry.rs1)) else {
                warn!("Skipping malformed ZRTP cache entry {}", peer);
                continue;
            };
            entries.insert(
                zid,
                CachedSecret {
                    rs1,
                    verified: entry.verified,
                    stored_at: entry.stored_at,
                    expires_at: entry.expires_at,
                },
            );
        }
        debug!("Loaded {} ZRTP cache entries", entries.len());

        Ok(Self {
            local_zid,
            entries: RwLock::new(entries),
            ttl: RwLock::new(ttl),
            path: Some(path.to_path_buf()),
        })
    }

    fn generate_zid() -> Zid {
        let mut zid = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut zid);
        zid
    }

    pub fn local_zid(&self) -> Zid {
        self.local_zid
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.read()
    }

    /// New TTL applies to entries stored from now on
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write() = ttl;
    }

    /// Live entry for a peer
    pub fn get(&self, peer: &Zid) -> Option<CachedSecret> {
        let now = Utc::now();
        self.entries
            .read()
            .get(peer)
            .filter(|e| !e.is_expired_at(now))
            .cloned()
    }

    /// Replace the retained secret for a peer
    pub fn store(&self, peer: Zid, rs1: Vec<u8>, verified: bool) {
        let now = Utc::now();
        let ttl = self.ttl();
        self.entries.write().insert(
            peer,
            CachedSecret {
                rs1,
                verified,
                stored_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn mark_verified(&self, peer: &Zid) -> bool {
        match self.entries.write().get_mut(peer) {
            Some(entry) => {
                entry.verified = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, peer: &Zid) -> bool {
        self.entries.write().remove(peer).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .values()
            .filter(|e| !e.is_expired_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the cache file (no-op for an in-memory cache)
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = CacheFile {
            local_zid: hex::encode(self.local_zid),
            entries: self
                .entries
                .read()
                .iter()
                .map(|(zid, e)| {
                    (
                        hex::encode(zid),
                        CacheEntryFile {
                            rs1: hex::encode(&e.rs1),
                            verified: e.verified,
                            stored_at: e.stored_at,
                            expires_at: e.expires_at,
                        },
                    )
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| DomainError::Internal(format!("Serialize ZRTP cache: {}", e)))?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| DomainError::Internal(format!("Write {}: {}", path.display(), e)))
    }
}
