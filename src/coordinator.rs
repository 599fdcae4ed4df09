//! Bounded-concurrency execution of independent analysis tasks.
//!
//! Tasks start in descending priority order and never more than
//! `max_concurrency` run at once. A failing task is retried with its
//! original input; once retries are exhausted it is recorded as failed and
//! the batch either continues or stops starting new tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// The capability a task runs with.
pub trait TaskHandler: Send + Sync + 'static {
    type Input: Send + Sync + 'static;
    type Output: Send + 'static;

    fn execute(&self, input: &Self::Input) -> impl Future<Output = Result<Self::Output>> + Send;
}

pub struct Task<H: TaskHandler> {
    pub id: String,
    /// Higher runs first when slots are scarce.
    pub priority: i32,
    pub input: H::Input,
    pub handler: Arc<H>,
}

impl<H: TaskHandler> Task<H> {
    pub fn new(id: impl Into<String>, priority: i32, input: H::Input, handler: Arc<H>) -> Self {
        Self {
            id: id.into(),
            priority,
            input,
            handler,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub max_concurrency: usize,
    pub continue_on_error: bool,
    pub retry_on_error: bool,
    pub max_retries: u32,
    /// Delay before the first retry; doubles with each further retry.
    pub retry_backoff: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            continue_on_error: true,
            retry_on_error: true,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
pub struct TaskOutcome<O> {
    pub success: bool,
    pub output: Option<O>,
    pub error: Option<Error>,
    pub attempts: u32,
    /// The task never started because the batch stopped early.
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct TaskBatchResult<O> {
    /// Outcomes keyed by task id.
    pub results: HashMap<String, TaskOutcome<O>>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// The batch stopped early after an unrecoverable failure.
    pub aborted: bool,
}

impl<O> TaskBatchResult<O> {
    pub fn get(&self, task_id: &str) -> Option<&TaskOutcome<O>> {
        self.results.get(task_id)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// Successful outputs with their task ids, sorted by id.
    pub fn into_outputs(self) -> Vec<(String, O)> {
        let mut outputs: Vec<(String, O)> = self
            .results
            .into_iter()
            .filter_map(|(id, outcome)| outcome.output.map(|o| (id, o)))
            .collect();
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        outputs
    }

    /// Ids and errors of tasks that failed or were cancelled, sorted by id.
    pub fn failures(&self) -> Vec<(&str, String)> {
        let mut failures: Vec<(&str, String)> = self
            .results
            .iter()
            .filter(|(_, o)| !o.success)
            .map(|(id, o)| {
                let message = o
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                (id.as_str(), message)
            })
            .collect();
        failures.sort_by(|a, b| a.0.cmp(b.0));
        failures
    }
}

pub struct TaskCoordinator {
    options: RunOptions,
}

impl TaskCoordinator {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run every task and collect per-task outcomes.
    ///
    /// Only misuse (zero concurrency, duplicate task ids) returns `Err`;
    /// task failures are reported inside the batch result.
    pub async fn run<H: TaskHandler>(
        &self,
        tasks: Vec<Task<H>>,
    ) -> Result<TaskBatchResult<H::Output>> {
        let options = &self.options;
        if options.max_concurrency == 0 {
            return Err(Error::ConfigValidation(
                "max_concurrency must be > 0".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
        }

        let mut ordered = tasks;
        // Stable: equal priorities keep submission order.
        ordered.sort_by_key(|t| std::cmp::Reverse(t.priority));
        let mut pending: VecDeque<Task<H>> = ordered.into();

        info!(
            tasks = pending.len(),
            max_concurrency = options.max_concurrency,
            "starting task batch"
        );

        let mut running = JoinSet::new();
        let mut results = HashMap::new();
        let mut aborted = false;

        loop {
            while !aborted && running.len() < options.max_concurrency {
                let Some(task) = pending.pop_front() else {
                    break;
                };
                debug!(task_id = task.id, priority = task.priority, "starting task");
                let policy = RetryPolicy::from_options(options);
                running.spawn(execute_with_retry(task, policy));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((id, outcome)) => {
                    if outcome.success {
                        info!(task_id = id, attempts = outcome.attempts, "task succeeded");
                    } else {
                        warn!(task_id = id, attempts = outcome.attempts, "task failed");
                        if !options.continue_on_error && !aborted {
                            info!(
                                task_id = id,
                                pending = pending.len(),
                                "stopping batch after failure"
                            );
                            aborted = true;
                        }
                    }
                    results.insert(id, outcome);
                }
                Err(e) => warn!(error = %e, "task supervisor failed"),
            }
        }

        for task in pending {
            results.insert(
                task.id.clone(),
                TaskOutcome {
                    success: false,
                    output: None,
                    error: Some(Error::TaskExecution {
                        task_id: task.id,
                        message: "cancelled after an earlier task failed".to_string(),
                    }),
                    attempts: 0,
                    cancelled: true,
                },
            );
        }

        let succeeded = results.values().filter(|o| o.success).count();
        let cancelled = results.values().filter(|o| o.cancelled).count();
        let failed = results.len() - succeeded - cancelled;
        info!(succeeded, failed, cancelled, aborted, "task batch complete");

        Ok(TaskBatchResult {
            results,
            succeeded,
            failed,
            cancelled,
            aborted,
        })
    }
}

#[derive(Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    fn from_options(options: &RunOptions) -> Self {
        let max_attempts = if options.retry_on_error {
            options.max_retries.saturating_add(1)
        } else {
            1
        };
        Self {
            max_attempts,
            backoff: options.retry_backoff,
        }
    }

    fn delay_before_retry(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

async fn execute_with_retry<H: TaskHandler>(
    task: Task<H>,
    policy: RetryPolicy,
) -> (String, TaskOutcome<H::Output>) {
    let Task {
        id, input, handler, ..
    } = task;
    let input = Arc::new(input);
    let mut attempts = 0;
    let mut last_error = None;

    while attempts < policy.max_attempts {
        attempts += 1;
        let attempt_handler = Arc::clone(&handler);
        let attempt_input = Arc::clone(&input);
        // Each attempt runs in its own task so a panicking handler is
        // reported as a failed attempt instead of tearing down the batch.
        let result = match tokio::spawn(async move {
            attempt_handler.execute(&attempt_input).await
        })
        .await
        {
            Ok(result) => result,
            Err(e) => Err(Error::TaskExecution {
                task_id: id.clone(),
                message: format!("handler panicked: {e}"),
            }),
        };

        match result {
            Ok(output) => {
                return (
                    id,
                    TaskOutcome {
                        success: true,
                        output: Some(output),
                        error: None,
                        attempts,
                        cancelled: false,
                    },
                );
            }
            Err(e) => {
                warn!(task_id = id, attempt = attempts, error = %e, "task attempt failed");
                last_error = Some(match e {
                    Error::TaskExecution { .. } => e,
                    other => Error::TaskExecution {
                        task_id: id.clone(),
                        message: other.to_string(),
                    },
                });
                if attempts < policy.max_attempts {
                    let delay = policy.delay_before_retry(attempts);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    (
        id,
        TaskOutcome {
            success: false,
            output: None,
            error: last_error,
            attempts,
            cancelled: false,
        },
    )
}
