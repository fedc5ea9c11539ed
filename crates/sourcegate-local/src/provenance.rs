//! Per-run ledger of attempted, verified and rejected URLs.
//!
//! All keys are normalized URLs. Verification is sticky: once a URL is verified it keeps
//! its first metadata, and later rejections of it are dropped. A rejected URL that later
//! verifies moves to the verified side, so the two sides never overlap.

use crate::urlnorm::normalize_or_raw;
use sourcegate_core::{RejectReason, Source, VerifiedMeta};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct Provenance {
    attempted: BTreeSet<String>,
    verified: Vec<VerifiedMeta>,
    verified_index: BTreeMap<String, usize>,
    rejected: BTreeMap<String, RejectReason>,
}

impl Provenance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the URL was not attempted before in this run.
    pub fn record_attempt(&mut self, url: &str) -> bool {
        self.attempted.insert(normalize_or_raw(url))
    }

    /// Record an accepted page. `requested` is what the tool was asked for; the entry is
    /// keyed by `meta.url` (the resolved URL that was classified).
    ///
    /// Returns `false` when the resolved URL was already verified; the first record stays.
    pub fn record_verified(&mut self, requested: &str, mut meta: VerifiedMeta) -> bool {
        let key = normalize_or_raw(&meta.url);
        self.rejected.remove(&normalize_or_raw(requested));
        self.rejected.remove(&key);
        if self.verified_index.contains_key(&key) {
            return false;
        }
        meta.url = key.clone();
        self.verified_index.insert(key, self.verified.len());
        self.verified.push(meta);
        true
    }

    /// Returns `false` when the URL is already verified and the rejection is ignored.
    pub fn record_rejected(&mut self, url: &str, reason: RejectReason) -> bool {
        let key = normalize_or_raw(url);
        if self.verified_index.contains_key(&key) {
            tracing::debug!(url = %key, %reason, "ignoring rejection of a verified url");
            return false;
        }
        self.rejected.insert(key, reason);
        true
    }

    pub fn is_attempted(&self, url: &str) -> bool {
        self.attempted.contains(&normalize_or_raw(url))
    }

    pub fn is_verified(&self, url: &str) -> bool {
        self.verified_index.contains_key(&normalize_or_raw(url))
    }

    pub fn attempted_count(&self) -> usize {
        self.attempted.len()
    }

    /// Verified entries in the order they were first verified.
    pub fn verified(&self) -> &[VerifiedMeta] {
        &self.verified
    }

    pub fn rejected(&self) -> &BTreeMap<String, RejectReason> {
        &self.rejected
    }

    pub fn rejection(&self, url: &str) -> Option<RejectReason> {
        self.rejected.get(&normalize_or_raw(url)).copied()
    }

    pub fn sources(&self) -> Vec<Source> {
        self.verified
            .iter()
            .map(|m| Source {
                url: m.url.clone(),
                title: m.title.clone(),
            })
            .collect()
    }
}
