//! Cross-result deduplication of findings reported by independent tasks.
//!
//! Two layers run in order: an exact signature built from the file, line and
//! the normalized core of the message, then a term-overlap similarity within
//! groups of findings that share a location. An optional vector pass drops
//! candidates that repeat something already published nearby.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::completion::VectorEncoder;
use crate::diff::normalize_path;
use crate::error::{Error, Result};
use crate::review_schema::Finding;

#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Characters of the core phrase that go into a signature.
    pub signature_prefix_len: usize,
    /// Pairs scoring strictly above this are merged.
    pub similarity_threshold: f64,
    pub vector_exact_threshold: f64,
    pub vector_nearby_threshold: f64,
    /// Lines on either side of a published finding checked by the vector pass.
    pub nearby_window: u32,
    pub message_weight: f64,
    pub suggestion_weight: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            signature_prefix_len: 50,
            similarity_threshold: 0.85,
            vector_exact_threshold: 0.90,
            vector_nearby_threshold: 0.95,
            nearby_window: 3,
            message_weight: 0.6,
            suggestion_weight: 0.4,
        }
    }
}

const SNIPPET_KEY_LEN: usize = 40;

pub struct Deduplicator {
    config: DedupConfig,
    markup: Regex,
    labels: Regex,
    emoji: Regex,
    emphasis: Regex,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::ConfigValidation(format!("dedup pattern: {e}")))
        };
        Ok(Self {
            config,
            markup: compile(
                r"(?i)\[\s*(critical|warning|info|error|high|medium|low|suggestion|nit)\s*\]",
            )?,
            labels: compile(
                r"(?i)(^\s*(critical|warning|info|error|note|nit|suggestion)\s*:|\b(severity|confidence|category)\s*[:=]\s*[\w.%]+)",
            )?,
            emoji: compile(r"[\p{Extended_Pictographic}\x{FE0F}\x{200D}]")?,
            emphasis: compile(r"\*+|~~|`+|__")?,
        })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Reduce a message to the phrase that carries its meaning: markup,
    /// labels, emoji and emphasis removed, lowercased, whitespace collapsed.
    pub fn core_phrase(&self, message: &str) -> String {
        let text = self.markup.replace_all(message, " ");
        let text = self.labels.replace_all(&text, " ");
        let text = self.emoji.replace_all(&text, " ");
        let text = self.emphasis.replace_all(&text, "");
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed
            .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
            .to_lowercase()
    }

    /// `file:line:corePhrasePrefix`. Findings without a line use their
    /// snippet key in the line slot, or `-` when they have neither.
    pub fn signature(&self, finding: &Finding) -> String {
        let line = match (finding.line, snippet_key(finding)) {
            (Some(line), _) => line.to_string(),
            (None, Some(snippet)) => snippet,
            (None, None) => "-".to_string(),
        };
        let prefix: String = self
            .core_phrase(&finding.message)
            .chars()
            .take(self.config.signature_prefix_len)
            .collect();
        format!("{}:{line}:{prefix}", normalize_path(&finding.file))
    }

    /// Weighted term overlap of messages and suggestions. When neither
    /// finding has a suggestion, the message overlap alone decides.
    pub fn similarity(&self, a: &Finding, b: &Finding) -> f64 {
        let message = overlap(&self.core_phrase(&a.message), &self.core_phrase(&b.message));
        if a.suggestion.trim().is_empty() && b.suggestion.trim().is_empty() {
            return message;
        }
        let suggestion = overlap(a.suggestion.trim(), b.suggestion.trim());
        self.config.message_weight * message + self.config.suggestion_weight * suggestion
    }

    /// Collapse duplicate findings, keeping the most confident of each
    /// cluster. Survivors keep their input order.
    pub fn dedupe(&self, findings: Vec<Finding>) -> Vec<Finding> {
        self.dedupe_by(findings, |f| f)
    }

    /// [`Deduplicator::dedupe`] over items that carry a finding, such as
    /// findings already attached to a diff position.
    pub fn dedupe_by<T, F>(&self, items: Vec<T>, finding_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &Finding,
    {
        let findings: Vec<&Finding> = items.iter().map(&finding_of).collect();
        let total = findings.len();
        let mut order: Vec<usize> = (0..total).collect();
        // Stable: equal confidence keeps the earlier finding.
        order.sort_by(|&a, &b| {
            findings[b]
                .confidence
                .partial_cmp(&findings[a].confidence)
                .unwrap_or(Ordering::Equal)
        });

        let mut signatures = HashSet::new();
        let mut groups: HashMap<(String, String), Vec<usize>> = HashMap::new();
        let mut keep = vec![false; total];

        for idx in order {
            let finding = findings[idx];
            let signature = self.signature(finding);
            if signatures.contains(&signature) {
                debug!(file = %finding.file, signature = %signature, "dropping exact duplicate");
                continue;
            }

            let group_key = (
                normalize_path(&finding.file).to_string(),
                location_key(finding),
            );
            let group = groups.entry(group_key).or_default();
            let similar = group.iter().any(|&kept| {
                self.similarity(finding, findings[kept]) > self.config.similarity_threshold
            });
            if similar {
                debug!(file = %finding.file, line = ?finding.line, "dropping similar finding");
                continue;
            }

            signatures.insert(signature);
            group.push(idx);
            keep[idx] = true;
        }

        let survivors: Vec<T> = items
            .into_iter()
            .zip(keep)
            .filter_map(|(f, k)| k.then_some(f))
            .collect();
        if survivors.len() < total {
            info!(
                before = total,
                after = survivors.len(),
                "deduplicated findings"
            );
        }
        survivors
    }

    /// Drop candidates that repeat a published finding at the same line or
    /// within the nearby window, judged by cosine similarity of encoded core
    /// phrases. If the encoder is unavailable the candidates pass unchanged.
    pub async fn filter_published<E, C>(
        &self,
        candidates: Vec<Finding>,
        published: &[Finding],
        encoder: &E,
        cache: &C,
    ) -> Vec<Finding>
    where
        E: VectorEncoder,
        C: Cache<Vec<f32>> + ?Sized,
    {
        let published: Vec<&Finding> = published.iter().filter(|p| p.line.is_some()).collect();
        if candidates.is_empty() || published.is_empty() {
            return candidates;
        }

        let mut phrases: Vec<String> = candidates
            .iter()
            .chain(published.iter().copied())
            .map(|f| self.core_phrase(&f.message))
            .collect();
        phrases.sort();
        phrases.dedup();

        let vectors = match self.encode_all(&phrases, encoder, cache).await {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(error = %e, "vector similarity unavailable, skipping published filter");
                return candidates;
            }
        };

        let before = candidates.len();
        let kept: Vec<Finding> = candidates
            .into_iter()
            .filter(|candidate| {
                let Some(line) = candidate.line else {
                    return true;
                };
                let Some(cv) = vectors.get(&self.core_phrase(&candidate.message)) else {
                    return true;
                };
                let duplicate = published.iter().any(|p| {
                    let Some(pline) = p.line else { return false };
                    if normalize_path(&p.file) != normalize_path(&candidate.file) {
                        return false;
                    }
                    let distance = line.abs_diff(pline);
                    let threshold = if distance == 0 {
                        self.config.vector_exact_threshold
                    } else if distance <= self.config.nearby_window {
                        self.config.vector_nearby_threshold
                    } else {
                        return false;
                    };
                    vectors
                        .get(&self.core_phrase(&p.message))
                        .is_some_and(|pv| cosine(cv, pv) >= threshold)
                });
                if duplicate {
                    debug!(file = %candidate.file, line, "already published nearby");
                }
                !duplicate
            })
            .collect();

        if kept.len() < before {
            info!(
                before,
                after = kept.len(),
                "filtered findings already published"
            );
        }
        kept
    }

    async fn encode_all<E, C>(
        &self,
        phrases: &[String],
        encoder: &E,
        cache: &C,
    ) -> Result<HashMap<String, Vec<f32>>>
    where
        E: VectorEncoder,
        C: Cache<Vec<f32>> + ?Sized,
    {
        let mut vectors = HashMap::new();
        let mut missing = Vec::new();
        for phrase in phrases {
            match cache.get(phrase) {
                Some(v) => {
                    vectors.insert(phrase.clone(), v);
                }
                None => missing.push(phrase.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(vectors);
        }

        let encoded = encoder
            .encode(&missing)
            .await
            .map_err(|e| match e {
                Error::DependencyUnavailable(_) => e,
                other => Error::DependencyUnavailable(other.to_string()),
            })?;
        if encoded.len() != missing.len() {
            return Err(Error::DependencyUnavailable(format!(
                "encoder returned {} vectors for {} texts",
                encoded.len(),
                missing.len()
            )));
        }
        for (phrase, vector) in missing.into_iter().zip(encoded) {
            cache.set(&phrase, vector.clone());
            vectors.insert(phrase, vector);
        }
        Ok(vectors)
    }
}

fn snippet_key(finding: &Finding) -> Option<String> {
    let snippet = finding.snippet.as_deref()?;
    let normalized = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }
    let prefix: String = normalized.to_lowercase().chars().take(SNIPPET_KEY_LEN).collect();
    Some(format!("snippet:{prefix}"))
}

/// Normalized snippet prefix when the finding has one, else the line
/// bucketed in pairs, else the whole file.
fn location_key(finding: &Finding) -> String {
    if let Some(key) = snippet_key(finding) {
        return key;
    }
    match finding.line {
        Some(line) => format!("line:{}", line / 2 * 2),
        None => "file".to_string(),
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
                .to_lowercase()
        })
        .filter(|t| t.chars().count() > 2)
        .collect()
}

fn overlap(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    jaccard(&tokens(a), &tokens(b))
}

/// An empty side scores 0; equal texts are caught by [`overlap`].
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.union(b).count();
    shared as f64 / union as f64
}

pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
