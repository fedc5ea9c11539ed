//! Namespaced, TTL-bounded JSON cache on the local filesystem.
//!
//! Layout: `root/<namespace>/<aa>/<bb>/<sha256(key)>.json`. Each file carries its own
//! expiry, so a TTL change only affects entries written afterwards.
//!
//! Reads never fail: missing, unreadable, corrupt or expired entries are misses.
//! Writes go through a temp file in the same directory and are renamed into place,
//! so concurrent writers of one key resolve last-writer-wins without torn files.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sourcegate_core::{Error, Result};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Search,
    Fetch,
    Render,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Search, Namespace::Fetch, Namespace::Render];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Search => "search",
            Namespace::Fetch => "fetch",
            Namespace::Render => "render",
        }
    }

    pub fn default_ttl(self) -> Duration {
        match self {
            Namespace::Search => Duration::from_secs(24 * 60 * 60),
            Namespace::Fetch | Namespace::Render => Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "search" => Ok(Namespace::Search),
            "fetch" => Ok(Namespace::Fetch),
            "render" => Ok(Namespace::Render),
            other => Err(Error::NotSupported(format!(
                "unknown cache namespace {other:?} (allowed: search, fetch, render)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub search: Duration,
    pub fetch: Duration,
    pub render: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            search: Namespace::Search.default_ttl(),
            fetch: Namespace::Fetch.default_ttl(),
            render: Namespace::Render.default_ttl(),
        }
    }
}

impl CacheTtls {
    pub fn for_namespace(&self, ns: Namespace) -> Duration {
        match ns {
            Namespace::Search => self.search,
            Namespace::Fetch => self.fetch,
            Namespace::Render => self.render,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    schema_version: u64,
    namespace: Namespace,
    key: String,
    stored_at_epoch_ms: u64,
    expires_at_epoch_ms: u64,
    value: serde_json::Value,
}

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
    ttls: CacheTtls,
}

impl FsCache {
    pub fn new(root: PathBuf) -> Self {
        Self::with_ttls(root, CacheTtls::default())
    }

    pub fn with_ttls(root: PathBuf, ttls: CacheTtls) -> Self {
        Self { root, ttls }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self, ns: Namespace) -> Duration {
        self.ttls.for_namespace(ns)
    }

    pub fn key_hash(key: &str) -> String {
        let mut h = Sha256::new();
        h.update(key.as_bytes());
        hex::encode(h.finalize())
    }

    fn path(&self, ns: Namespace, key: &str) -> PathBuf {
        let hash = Self::key_hash(key);
        self.root
            .join(ns.as_str())
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(format!("{hash}.json"))
    }

    pub fn get<T: DeserializeOwned>(&self, ns: Namespace, key: &str) -> Option<T> {
        self.get_at(ns, key, now_epoch_ms())
    }

    /// Lookup as of `now_ms`. A hit requires `now_ms < expiry`.
    pub fn get_at<T: DeserializeOwned>(&self, ns: Namespace, key: &str, now_ms: u64) -> Option<T> {
        let path = self.path(ns, key);
        let bytes = fs::read(&path).ok()?;
        let entry: Entry = match serde_json::from_slice(&bytes) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(namespace = %ns, path = %path.display(), error = %e, "cache entry unreadable; treating as miss");
                return None;
            }
        };
        if entry.schema_version != SCHEMA_VERSION || entry.namespace != ns || entry.key != key {
            return None;
        }
        if now_ms >= entry.expires_at_epoch_ms {
            return None;
        }
        match serde_json::from_value(entry.value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!(namespace = %ns, error = %e, "cache value has unexpected shape; treating as miss");
                None
            }
        }
    }

    pub fn put<T: Serialize>(&self, ns: Namespace, key: &str, value: &T) -> Result<()> {
        self.put_at(ns, key, value, now_epoch_ms())
    }

    /// Store unconditionally, resetting the entry's expiry to `now_ms + ttl(ns)`.
    pub fn put_at<T: Serialize>(&self, ns: Namespace, key: &str, value: &T, now_ms: u64) -> Result<()> {
        let path = self.path(ns, key);
        let dir = path
            .parent()
            .ok_or_else(|| Error::Cache("cache path has no parent".to_string()))?;
        fs::create_dir_all(dir).map_err(|e| Error::Cache(e.to_string()))?;

        let ttl_ms = self.ttl(ns).as_millis() as u64;
        let entry = Entry {
            schema_version: SCHEMA_VERSION,
            namespace: ns,
            key: key.to_string(),
            stored_at_epoch_ms: now_ms,
            expires_at_epoch_ms: now_ms.saturating_add(ttl_ms),
            value: serde_json::to_value(value).map_err(|e| Error::Cache(e.to_string()))?,
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| Error::Cache(e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::Cache(e.to_string()))?;
        tmp.write_all(&bytes)
            .map_err(|e| Error::Cache(e.to_string()))?;
        tmp.persist(&path)
            .map_err(|e| Error::Cache(e.error.to_string()))?;
        Ok(())
    }

    /// Remove one namespace, or everything. Returns the number of entry files removed.
    pub fn clear(&self, ns: Option<Namespace>) -> Result<usize> {
        let targets: Vec<Namespace> = match ns {
            Some(ns) => vec![ns],
            None => Namespace::ALL.to_vec(),
        };
        let mut removed = 0usize;
        for ns in targets {
            let dir = self.root.join(ns.as_str());
            if !dir.exists() {
                continue;
            }
            removed += count_json_files(&dir);
            fs::remove_dir_all(&dir).map_err(|e| Error::Cache(e.to_string()))?;
        }
        Ok(removed)
    }
}

fn count_json_files(dir: &Path) -> usize {
    let Ok(rd) = fs::read_dir(dir) else {
        return 0;
    };
    let mut n = 0usize;
    for ent in rd.flatten() {
        let p = ent.path();
        if p.is_dir() {
            n += count_json_files(&p);
        } else if p.extension().is_some_and(|e| e == "json") {
            n += 1;
        }
    }
    n
}
