//! Locate a code snippet inside a parsed diff.
//!
//! Matching is tiered: exact trimmed equality beats whitespace-normalized
//! equality, which beats containment and token overlap. Resolution walks
//! new-file line numbers by default; [`LineResolver::resolve_removed`] walks
//! old-file numbers for snippets that only exist on removed lines.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::diff::{DiffLine, LineKind, ParsedDiff};
use crate::error::{Error, Result};
use crate::review_schema::Finding;

const EXACT_SCORE: f64 = 1.0;
const NORMALIZED_SCORE: f64 = 0.9;
const CONTAINS_SCORE: f64 = 0.85;
/// Token-overlap matches scale into `[0, TOKEN_SCORE_CEILING]`.
const TOKEN_SCORE_CEILING: f64 = 0.8;
const MIN_CONTAINED_SNIPPET_CHARS: usize = 8;
const MIN_TOKEN_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvePolicy {
    /// Allow containment and token-overlap matches.
    pub fuzzy: bool,
    /// Rank added lines above context lines (and removed lines above context
    /// lines on the old side) when scores tie.
    pub prefer_added: bool,
    pub token_overlap_threshold: f64,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            fuzzy: true,
            prefer_added: true,
            token_overlap_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Old,
    New,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub line: u32,
    pub side: Side,
    pub kind: LineKind,
    pub score: f64,
}

/// Where a finding gets attached when published as an inline comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anchor {
    pub file: String,
    pub is_old_file: bool,
    pub line: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LineResolver {
    policy: ResolvePolicy,
}

impl LineResolver {
    pub fn new(policy: ResolvePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ResolvePolicy {
        &self.policy
    }

    /// Resolve `snippet` to a new-file line among added and context lines.
    pub fn resolve(&self, diff: &ParsedDiff, file: &str, snippet: &str) -> Option<Resolution> {
        self.best_match(diff, file, snippet, Side::New)
    }

    /// Resolve `snippet` to an old-file line among removed and context lines.
    pub fn resolve_removed(
        &self,
        diff: &ParsedDiff,
        file: &str,
        snippet: &str,
    ) -> Option<Resolution> {
        self.best_match(diff, file, snippet, Side::Old)
    }

    /// True when the snippet matches some removed line and no added or
    /// context line.
    pub fn is_only_in_removed_lines(&self, diff: &ParsedDiff, file: &str, snippet: &str) -> bool {
        let Some(file_diff) = diff.file(file) else {
            return false;
        };
        let needle = first_line(snippet);
        let mut in_removed = false;
        for line in file_diff.hunks.iter().flat_map(|h| &h.lines) {
            if self.score(&line.content, needle).is_none() {
                continue;
            }
            match line.kind {
                LineKind::Removed => in_removed = true,
                LineKind::Added | LineKind::Context => return false,
            }
        }
        in_removed
    }

    /// Decide where a finding should be published.
    ///
    /// The snippet wins over the explicit line; it is anchored to the old
    /// file only when it occurs exclusively on removed lines. An explicit line
    /// is accepted when it falls inside one of the file's hunks.
    pub fn anchor(&self, diff: &ParsedDiff, finding: &Finding) -> Result<Anchor> {
        let unresolved = || Error::UnresolvedLocation {
            file: finding.file.clone(),
            snippet: finding
                .snippet
                .clone()
                .or_else(|| finding.line.map(|l| format!("line {l}")))
                .unwrap_or_default(),
        };

        let file_diff = diff.file(&finding.file).ok_or_else(unresolved)?;
        let path = file_diff.path().to_string();

        if let Some(snippet) = finding.snippet.as_deref().filter(|s| !s.trim().is_empty()) {
            let resolution = if self.is_only_in_removed_lines(diff, &path, snippet) {
                self.resolve_removed(diff, &path, snippet)
            } else {
                self.resolve(diff, &path, snippet)
            };
            if let Some(r) = resolution {
                return Ok(Anchor {
                    file: path,
                    is_old_file: r.side == Side::Old,
                    line: r.line,
                });
            }
            debug!(file = %path, snippet, "snippet did not resolve, trying explicit line");
        }

        if let Some(line) = finding.line
            && file_diff.hunks.iter().any(|h| h.contains_new_line(line))
        {
            return Ok(Anchor {
                file: path,
                is_old_file: false,
                line,
            });
        }

        Err(unresolved())
    }

    /// Score how well `line` matches `snippet`, or `None` below threshold.
    pub fn score(&self, line: &str, snippet: &str) -> Option<f64> {
        let line = line.trim();
        let snippet = snippet.trim();
        if snippet.is_empty() || line.is_empty() {
            return None;
        }
        if line == snippet {
            return Some(EXACT_SCORE);
        }

        let norm_line = normalize_whitespace(line);
        let norm_snippet = normalize_whitespace(snippet);
        if norm_line == norm_snippet {
            return Some(NORMALIZED_SCORE);
        }
        if !self.policy.fuzzy {
            return None;
        }

        if norm_snippet.chars().count() >= MIN_CONTAINED_SNIPPET_CHARS
            && norm_line.contains(&norm_snippet)
        {
            return Some(CONTAINS_SCORE);
        }

        let ratio = token_overlap(line, snippet);
        if ratio > 0.0 && ratio >= self.policy.token_overlap_threshold {
            return Some(TOKEN_SCORE_CEILING * ratio);
        }
        None
    }

    fn kind_rank(&self, kind: LineKind, side: Side) -> u8 {
        if !self.policy.prefer_added {
            return 0;
        }
        match (side, kind) {
            (Side::New, LineKind::Added) | (Side::Old, LineKind::Removed) => 2,
            (_, LineKind::Context) => 1,
            _ => 0,
        }
    }

    fn best_match(
        &self,
        diff: &ParsedDiff,
        file: &str,
        snippet: &str,
        side: Side,
    ) -> Option<Resolution> {
        let file_diff = diff.file(file)?;
        let needle = first_line(snippet);
        let mut best: Option<(Resolution, u8)> = None;

        for line in file_diff.hunks.iter().flat_map(|h| &h.lines) {
            let Some(number) = line_number(line, side) else {
                continue;
            };
            let Some(score) = self.score(&line.content, needle) else {
                continue;
            };
            let rank = self.kind_rank(line.kind, side);
            let better = match &best {
                None => true,
                Some((current, current_rank)) => {
                    score
                        .total_cmp(&current.score)
                        .then(rank.cmp(current_rank))
                        .then(current.line.cmp(&number))
                        .is_gt()
                }
            };
            if better {
                best = Some((
                    Resolution {
                        line: number,
                        side,
                        kind: line.kind,
                        score,
                    },
                    rank,
                ));
            }
        }

        best.map(|(resolution, _)| resolution)
    }
}

fn line_number(line: &DiffLine, side: Side) -> Option<u32> {
    match side {
        Side::New => line.new_line,
        Side::Old => line.old_line,
    }
}

/// Multi-line snippets are matched by their first non-blank line.
fn first_line(snippet: &str) -> &str {
    snippet
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or(snippet)
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn token_overlap(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.split_whitespace()
            .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
            .map(str::to_string)
            .collect()
    };
    let a = tokens(a);
    let b = tokens(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}
