use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::diff::ParsedDiff;
use crate::state::ChangeRecord;

/// Per-file summary the fingerprint is computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTuple {
    pub path: String,
    pub additions: u32,
    pub deletions: u32,
}

/// `(path, additions, deletions)` for every file, sorted by path.
pub fn file_tuples(diff: &ParsedDiff) -> Vec<FileTuple> {
    let mut tuples: Vec<FileTuple> = diff
        .files
        .iter()
        .map(|f| FileTuple {
            path: f.path().to_string(),
            additions: f.additions,
            deletions: f.deletions,
        })
        .collect();
    tuples.sort_by(|a, b| a.path.cmp(&b.path));
    tuples
}

/// Content hash identifying a change for incremental re-use.
///
/// Equal fingerprints mean equal per-file line counts, not byte-identical
/// diffs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(diff: &ParsedDiff) -> Self {
        Self::from_tuples(&file_tuples(diff))
    }

    pub fn from_tuples(tuples: &[FileTuple]) -> Self {
        let mut sorted: Vec<&FileTuple> = tuples.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        let mut hasher = Sha256::new();
        for t in sorted {
            hasher.update(t.path.as_bytes());
            hasher.update([0]);
            hasher.update(t.additions.to_string().as_bytes());
            hasher.update([0]);
            hasher.update(t.deletions.to_string().as_bytes());
            hasher.update(b"\n");
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Accept only well-formed (64 lowercase hex chars) fingerprints.
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == 64
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FullReason {
    NoPriorState,
    Changed,
    Stale,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "reason")]
pub enum ReviewMode {
    /// Prior results are reused; nothing is re-analyzed.
    Incremental,
    /// Everything is recomputed.
    Full(FullReason),
}

/// Choose between incremental and full mode.
///
/// Any doubt about the prior record (missing, malformed fingerprint, tuples
/// that disagree with its fingerprint) selects full mode.
pub fn decide_mode(diff: &ParsedDiff, prior: Option<&ChangeRecord>) -> ReviewMode {
    let Some(prior) = prior else {
        info!("no prior state, running full review");
        return ReviewMode::Full(FullReason::NoPriorState);
    };

    let Some(stored) = Fingerprint::parse(&prior.fingerprint) else {
        info!("prior fingerprint malformed, running full review");
        return ReviewMode::Full(FullReason::Stale);
    };

    let tuples = file_tuples(diff);
    let current = Fingerprint::from_tuples(&tuples);
    if stored != current {
        debug!(%stored, %current, "fingerprint changed");
        return ReviewMode::Full(FullReason::Changed);
    }

    // The stored tuples guard against hash collisions and hand-edited records.
    if prior.files != tuples || Fingerprint::from_tuples(&prior.files) != stored {
        info!("prior record inconsistent with its fingerprint, running full review");
        return ReviewMode::Full(FullReason::Stale);
    }

    info!(fingerprint = %current, "diff unchanged since last run, reusing results");
    ReviewMode::Incremental
}
