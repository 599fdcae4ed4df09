//! One review run over a change: parse, pick full or incremental mode, fan
//! out to the analysis tasks, then locate, merge, publish and record the
//! findings.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{Cache, MemoryCache};
use crate::completion::{CompletionClient, VectorEncoder};
use crate::config::Config;
use crate::coordinator::TaskCoordinator;
use crate::dedup::Deduplicator;
use crate::diff::{ParsedDiff, parse_diff_lenient};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FullReason, ReviewMode, decide_mode, file_tuples};
use crate::resolver::{Anchor, LineResolver};
use crate::review_schema::{Finding, GeneratedTest};
use crate::state::{ChangeRecord, StateStore};
use crate::tasks::{AnalysisHandler, TaskRegistry};

/// A finding together with where it is attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedFinding {
    pub anchor: Anchor,
    #[serde(flatten)]
    pub finding: Finding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTask {
    pub task_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub change_id: String,
    pub fingerprint: String,
    #[serde(flatten)]
    pub mode: ReviewMode,
    pub tasks_run: usize,
    /// Findings produced before deduplication.
    pub raw_findings: usize,
    pub findings: Vec<PublishedFinding>,
    /// Findings whose location could not be determined; kept but not published.
    pub unresolved: Vec<Finding>,
    pub generated_tests: Vec<GeneratedTest>,
    pub failed_tasks: Vec<FailedTask>,
    /// Files dropped from the diff because they could not be parsed.
    pub skipped_files: Vec<String>,
    /// The batch stopped early after a task failed.
    pub aborted: bool,
    pub publish_error: Option<String>,
}

/// Consumes the final, anchored findings of a run.
pub trait Publisher: Send + Sync {
    fn publish(&self, change_id: &str, findings: &[PublishedFinding]) -> Result<()>;
}

/// Writes one JSON object per finding.
pub struct JsonPublisher<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonPublisher<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> Publisher for JsonPublisher<W> {
    fn publish(&self, change_id: &str, findings: &[PublishedFinding]) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("publisher lock poisoned")))?;
        for finding in findings {
            let line = serde_json::json!({ "change_id": change_id, "finding": finding });
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Observer for pipeline progress events.
pub trait ProgressReporter: Send + Sync {
    fn mode_decided(&self, mode: &ReviewMode);
    fn tasks_started(&self, ids: &[String]);
    fn task_finished(&self, id: &str, success: bool);
    fn summary(&self, report: &PipelineReport);
}

/// Default reporter that prints to stderr.
pub struct StderrReporter;

impl ProgressReporter for StderrReporter {
    fn mode_decided(&self, mode: &ReviewMode) {
        match mode {
            ReviewMode::Incremental => eprintln!("[diffsweep] Diff unchanged, reusing prior results"),
            ReviewMode::Full(reason) => eprintln!("[diffsweep] Full review ({reason:?})"),
        }
    }

    fn tasks_started(&self, ids: &[String]) {
        eprintln!(
            "[diffsweep] Running {} analysis tasks: {}",
            ids.len(),
            ids.join(", ")
        );
    }

    fn task_finished(&self, id: &str, success: bool) {
        let status = if success { "done" } else { "failed" };
        eprintln!("[diffsweep] {id}: {status}");
    }

    fn summary(&self, report: &PipelineReport) {
        eprintln!(
            "[diffsweep] {} findings ({} before dedup, {} unresolved), {} tests, {} failed tasks",
            report.findings.len(),
            report.raw_findings,
            report.unresolved.len(),
            report.generated_tests.len(),
            report.failed_tasks.len()
        );
    }
}

/// One orchestration run per call: parse, decide mode, fan out, merge,
/// anchor, publish, persist.
pub struct Pipeline<C, E, S, P, R = StderrReporter> {
    registry: TaskRegistry,
    handler: Arc<AnalysisHandler<C>>,
    coordinator: TaskCoordinator,
    deduplicator: Deduplicator,
    resolver: LineResolver,
    encoder: Option<E>,
    vectors: Box<dyn Cache<Vec<f32>>>,
    state: S,
    publisher: P,
    reporter: R,
}

impl<C, E, S, P> Pipeline<C, E, S, P>
where
    C: CompletionClient,
    E: VectorEncoder,
    S: StateStore,
    P: Publisher,
{
    pub fn new(
        config: &Config,
        handler: AnalysisHandler<C>,
        encoder: Option<E>,
        state: S,
        publisher: P,
    ) -> Result<Self> {
        Ok(Self {
            registry: TaskRegistry::from_config(config),
            handler: Arc::new(handler),
            coordinator: TaskCoordinator::new(config.run.clone()),
            deduplicator: Deduplicator::new(config.dedup.clone())?,
            resolver: LineResolver::new(config.resolver),
            encoder,
            vectors: Box::new(MemoryCache::<Vec<f32>>::new()),
            state,
            publisher,
            reporter: StderrReporter,
        })
    }
}

impl<C, E, S, P, R> Pipeline<C, E, S, P, R>
where
    C: CompletionClient,
    E: VectorEncoder,
    S: StateStore,
    P: Publisher,
    R: ProgressReporter,
{
    pub fn with_reporter<R2: ProgressReporter>(self, reporter: R2) -> Pipeline<C, E, S, P, R2> {
        Pipeline {
            registry: self.registry,
            handler: self.handler,
            coordinator: self.coordinator,
            deduplicator: self.deduplicator,
            resolver: self.resolver,
            encoder: self.encoder,
            vectors: self.vectors,
            state: self.state,
            publisher: self.publisher,
            reporter,
        }
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_vector_cache(mut self, cache: Box<dyn Cache<Vec<f32>>>) -> Self {
        self.vectors = cache;
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub async fn run(
        &self,
        change_id: &str,
        raw_diff: &str,
        force_full: bool,
    ) -> Result<PipelineReport> {
        let (diff, parse_errors) = parse_diff_lenient(raw_diff);
        let skipped_files: Vec<String> = parse_errors.iter().map(|e| e.to_string()).collect();
        let fingerprint = Fingerprint::of(&diff);

        let prior = self.state.load(change_id);
        let mode = if force_full {
            ReviewMode::Full(FullReason::Forced)
        } else {
            decide_mode(&diff, prior.as_ref())
        };
        self.reporter.mode_decided(&mode);
        info!(change_id, %fingerprint, ?mode, files = diff.files.len(), "starting run");

        // Findings already published for this change, unless the record
        // itself is untrustworthy.
        let history = match (mode, prior) {
            (ReviewMode::Full(FullReason::Stale), _) | (_, None) => ChangeRecord::default(),
            (_, Some(prior)) => prior,
        };

        let mut report = PipelineReport {
            change_id: change_id.to_string(),
            fingerprint: fingerprint.to_string(),
            mode,
            tasks_run: 0,
            raw_findings: 0,
            findings: Vec::new(),
            unresolved: Vec::new(),
            generated_tests: Vec::new(),
            failed_tasks: Vec::new(),
            skipped_files,
            aborted: false,
            publish_error: None,
        };

        let fresh = match mode {
            ReviewMode::Incremental => {
                report.generated_tests = history.generated_tests.clone();
                let (published, unresolved) = self.anchor_all(&diff, history.findings.clone());
                report.findings = published;
                report.unresolved = unresolved;
                None
            }
            ReviewMode::Full(_) => Some(self.analyze(&diff, &history, &mut report).await?),
        };

        if let Some(fresh) = fresh {
            if !fresh.is_empty() {
                if let Err(e) = self.publisher.publish(change_id, &fresh) {
                    warn!(change_id, error = %e, "publishing failed");
                    report.publish_error = Some(e.to_string());
                }
            }
            report.findings = fresh;

            let mut known = history.findings;
            known.extend(report.findings.iter().map(|p| p.finding.clone()));
            known.extend(report.unresolved.iter().cloned());
            let record = ChangeRecord {
                fingerprint: fingerprint.to_string(),
                updated_at: ChangeRecord::now(),
                files: file_tuples(&diff),
                findings: self.deduplicator.dedupe(known),
                generated_tests: report.generated_tests.clone(),
            };
            if let Err(e) = self.state.save(change_id, &record) {
                warn!(change_id, error = %e, "failed to save state");
            }
        }

        self.reporter.summary(&report);
        Ok(report)
    }

    /// Full-mode analysis: run every applicable task, anchor, merge and drop
    /// what history already covers. Returns the findings to publish.
    async fn analyze(
        &self,
        diff: &ParsedDiff,
        history: &ChangeRecord,
        report: &mut PipelineReport,
    ) -> Result<Vec<PublishedFinding>> {
        let tasks = self.registry.plan(diff, &self.handler);
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        report.tasks_run = tasks.len();
        self.reporter.tasks_started(&ids);

        let batch = self.coordinator.run(tasks).await?;
        for id in &ids {
            if let Some(outcome) = batch.get(id) {
                self.reporter.task_finished(id, outcome.success);
            }
        }
        report.aborted = batch.aborted;
        report.failed_tasks = batch
            .failures()
            .into_iter()
            .map(|(task_id, error)| FailedTask {
                task_id: task_id.to_string(),
                error,
            })
            .collect();

        let mut candidates = Vec::new();
        for (_, output) in batch.into_outputs() {
            candidates.extend(output.findings);
            report.generated_tests.extend(output.tests);
        }
        report.raw_findings = candidates.len();

        let (located, unresolved) = self.anchor_all(diff, candidates);
        let mut published = self.deduplicator.dedupe_by(located, |p| &p.finding);
        report.unresolved = self.deduplicator.dedupe(unresolved);

        if let Some(encoder) = &self.encoder
            && !history.findings.is_empty()
            && !published.is_empty()
        {
            let anchored: Vec<Finding> = published.iter().map(|p| p.finding.clone()).collect();
            let kept = self
                .deduplicator
                .filter_published(anchored, &history.findings, encoder, self.vectors.as_ref())
                .await;
            published.retain(|p| kept.contains(&p.finding));
        }
        Ok(published)
    }

    fn anchor_all(
        &self,
        diff: &ParsedDiff,
        findings: Vec<Finding>,
    ) -> (Vec<PublishedFinding>, Vec<Finding>) {
        let mut published = Vec::new();
        let mut unresolved = Vec::new();
        for finding in findings {
            match self.resolver.anchor(diff, &finding) {
                Ok(anchor) => {
                    let mut finding = finding;
                    if finding.line.is_none() && !anchor.is_old_file {
                        finding.line = Some(anchor.line);
                    }
                    published.push(PublishedFinding { anchor, finding });
                }
                Err(e) => {
                    debug!(error = %e, "finding not publishable");
                    unresolved.push(finding);
                }
            }
        }
        if !unresolved.is_empty() {
            info!(count = unresolved.len(), "findings left unresolved");
        }
        (published, unresolved)
    }
}
