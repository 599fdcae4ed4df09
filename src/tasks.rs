//! The fixed set of analysis tasks a change is fanned out to.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::completion::CompletionClient;
use crate::config::Config;
use crate::coordinator::{Task, TaskHandler};
use crate::diff::{FileDiff, ParsedDiff};
use crate::error::{Error, Result};
use crate::pool::{WorkerJob, WorkerPool};
use crate::prompts::{
    PromptContext, PromptEngine, REVIEW_SYSTEM, REVIEW_USER, SCENARIO_SYSTEM, SCENARIO_USER,
};
use crate::review_schema::{Finding, GeneratedTest, parse_findings, parse_generated_tests};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewDimension {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    /// File extensions the dimension applies to; empty means every file.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub focus: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestScenario {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub focus: String,
    /// Command (argv) that runs the generated tests.
    #[serde(default)]
    pub verify: Option<Vec<String>>,
}

fn dimension(name: &str, priority: i32, focus: &str) -> ReviewDimension {
    ReviewDimension {
        name: name.to_string(),
        priority,
        extensions: Vec::new(),
        focus: focus.to_string(),
    }
}

/// Dimensions used when the config names none.
pub fn default_dimensions() -> Vec<ReviewDimension> {
    vec![
        dimension(
            "correctness",
            30,
            "Logic errors, unhandled cases, broken invariants.",
        ),
        dimension(
            "security",
            20,
            "Injection, unsafe input handling, leaked secrets.",
        ),
        dimension(
            "performance",
            10,
            "Needless allocation, quadratic work, blocking calls on hot paths.",
        ),
        dimension("maintainability", 0, "Unclear naming, duplication, dead code."),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisTask {
    Review(ReviewDimension),
    TestScenario(TestScenario),
}

impl AnalysisTask {
    pub fn name(&self) -> &str {
        match self {
            AnalysisTask::Review(d) => &d.name,
            AnalysisTask::TestScenario(s) => &s.name,
        }
    }

    /// Coordinator task id, unique within a registry.
    pub fn id(&self) -> String {
        match self {
            AnalysisTask::Review(d) => format!("review:{}", d.name),
            AnalysisTask::TestScenario(s) => format!("scenario:{}", s.name),
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            AnalysisTask::Review(d) => d.priority,
            AnalysisTask::TestScenario(s) => s.priority,
        }
    }

    fn extensions(&self) -> &[String] {
        match self {
            AnalysisTask::Review(d) => &d.extensions,
            AnalysisTask::TestScenario(s) => &s.extensions,
        }
    }

    fn focus(&self) -> &str {
        match self {
            AnalysisTask::Review(d) => &d.focus,
            AnalysisTask::TestScenario(s) => &s.focus,
        }
    }

    pub fn applies_to(&self, file: &FileDiff) -> bool {
        let extensions = self.extensions();
        if extensions.is_empty() {
            return true;
        }
        let Some(ext) = file.extension() else {
            return false;
        };
        extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Input of one analysis task: the variant to run and its own copy of the
/// diff, restricted to the files the variant applies to.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub task: AnalysisTask,
    pub diff: ParsedDiff,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisOutput {
    pub findings: Vec<Finding>,
    pub tests: Vec<GeneratedTest>,
}

pub struct TaskRegistry {
    tasks: Vec<AnalysisTask>,
}

impl TaskRegistry {
    pub fn new(tasks: Vec<AnalysisTask>) -> Self {
        Self { tasks }
    }

    pub fn from_config(config: &Config) -> Self {
        let reviews = if config.reviews.is_empty() {
            default_dimensions()
        } else {
            config.reviews.clone()
        };
        let tasks = reviews
            .into_iter()
            .map(AnalysisTask::Review)
            .chain(config.scenarios.iter().cloned().map(AnalysisTask::TestScenario))
            .collect();
        Self { tasks }
    }

    pub fn tasks(&self) -> &[AnalysisTask] {
        &self.tasks
    }

    /// Coordinator tasks for every variant that applies to at least one
    /// file of the diff.
    pub fn plan<C: CompletionClient>(
        &self,
        diff: &ParsedDiff,
        handler: &Arc<AnalysisHandler<C>>,
    ) -> Vec<Task<AnalysisHandler<C>>> {
        self.tasks
            .iter()
            .filter_map(|task| {
                let scoped = diff.filter(|f| task.applies_to(f));
                if scoped.is_empty() {
                    debug!(task = task.name(), "no applicable files, skipping");
                    return None;
                }
                Some(Task::new(
                    task.id(),
                    task.priority(),
                    TaskInput {
                        task: task.clone(),
                        diff: scoped,
                    },
                    Arc::clone(handler),
                ))
            })
            .collect()
    }
}

/// Runs a review dimension or test scenario against a completion client.
pub struct AnalysisHandler<C> {
    client: C,
    prompts: PromptEngine,
    pool: Option<WorkerPool>,
    work_dir: PathBuf,
    verify_timeout: Duration,
}

impl<C: CompletionClient> AnalysisHandler<C> {
    pub fn new(client: C, prompts: PromptEngine) -> Self {
        Self {
            client,
            prompts,
            pool: None,
            work_dir: PathBuf::from("."),
            verify_timeout: Duration::from_secs(600),
        }
    }

    /// Verify generated tests by running scenario commands on `pool` inside
    /// `work_dir`.
    pub fn with_pool(mut self, pool: WorkerPool, work_dir: PathBuf, timeout: Duration) -> Self {
        self.pool = Some(pool);
        self.work_dir = work_dir;
        self.verify_timeout = timeout;
        self
    }

    async fn review(&self, id: &str, ctx: &PromptContext) -> Result<AnalysisOutput> {
        let system = self.prompts.render(REVIEW_SYSTEM, ctx)?;
        let user = self.prompts.render(REVIEW_USER, ctx)?;
        let raw = self.client.complete(&system, &user).await?;
        let findings = parse_findings(&raw, id)?;
        info!(task = id, findings = findings.len(), "review finished");
        Ok(AnalysisOutput {
            findings,
            tests: Vec::new(),
        })
    }

    async fn scenario(
        &self,
        id: &str,
        scenario: &TestScenario,
        ctx: &PromptContext,
    ) -> Result<AnalysisOutput> {
        let system = self.prompts.render(SCENARIO_SYSTEM, ctx)?;
        let user = self.prompts.render(SCENARIO_USER, ctx)?;
        let raw = self.client.complete(&system, &user).await?;
        let mut tests = parse_generated_tests(&raw, &scenario.name)?;

        if let (Some(verify), Some(pool)) = (&scenario.verify, &self.pool)
            && !tests.is_empty()
        {
            self.verify(id, verify, pool, &tests).await?;
            for test in &mut tests {
                test.verified = Some(true);
            }
        }

        info!(task = id, tests = tests.len(), "scenario finished");
        Ok(AnalysisOutput {
            findings: Vec::new(),
            tests,
        })
    }

    /// Write the tests into the work dir, run the verify command through the
    /// pool, then remove them again. Only files this call created are
    /// removed; a test whose path already exists fails the task.
    async fn verify(
        &self,
        id: &str,
        command: &[String],
        pool: &WorkerPool,
        tests: &[GeneratedTest],
    ) -> Result<()> {
        let Some((program, args)) = command.split_first() else {
            return Err(Error::ConfigValidation(format!(
                "{id}: verify command is empty"
            )));
        };

        let mut written = Vec::new();
        let result = self
            .write_and_run(id, program, args, pool, tests, &mut written)
            .await;

        for path in &written {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove generated test");
            }
        }
        result
    }

    async fn write_and_run(
        &self,
        id: &str,
        program: &str,
        args: &[String],
        pool: &WorkerPool,
        tests: &[GeneratedTest],
        written: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for test in tests {
            let path = self.work_dir.join(safe_relative(&test.file)?);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(Error::TaskExecution {
                        task_id: id.to_string(),
                        message: format!(
                            "generated test {} would overwrite an existing file",
                            test.file
                        ),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            written.push(path);
            file.write_all(test.content.as_bytes())?;
        }

        let job = WorkerJob::new(id, program, self.verify_timeout)
            .with_args(args.to_vec())
            .with_work_dir(self.work_dir.clone());
        let output = pool.submit(job).await?;
        if output.success() {
            return Ok(());
        }
        Err(Error::TaskExecution {
            task_id: id.to_string(),
            message: format!(
                "verification exited with code {}: {}",
                output.exit_code,
                last_lines(&output.stderr, 5)
            ),
        })
    }
}

impl<C: CompletionClient> TaskHandler for AnalysisHandler<C> {
    type Input = TaskInput;
    type Output = AnalysisOutput;

    async fn execute(&self, input: &TaskInput) -> Result<AnalysisOutput> {
        let id = input.task.id();
        let ctx = PromptContext {
            name: input.task.name().to_string(),
            focus: input.task.focus().to_string(),
            files: input.diff.files.iter().map(|f| f.path().to_string()).collect(),
            diff: input.diff.render(),
        };
        match &input.task {
            AnalysisTask::Review(_) => self.review(&id, &ctx).await,
            AnalysisTask::TestScenario(scenario) => self.scenario(&id, scenario, &ctx).await,
        }
    }
}

/// Reject generated paths that would escape the work dir.
fn safe_relative(file: &str) -> Result<&Path> {
    let path = Path::new(file);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if file.trim().is_empty() || escapes {
        return Err(Error::Schema(format!("refusing to write test to {file}")));
    }
    Ok(path)
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
