//! Worker execution pool for long-running, cancellable jobs.
//!
//! A single scheduler task owns the job queue and the table of running jobs
//! and applies one transition (submit, finish, timeout, cleanup) at a time.
//! Each job executes in its own spawned task; the [`ProcessJobRunner`] runs
//! it as a child process in its own process group, so terminating the job
//! kills the whole group.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};

pub type JobId = u64;

#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub name: String,
    pub work_dir: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    /// Data handed to the job: stdin for processes, free-form for in-process
    /// runners.
    pub payload: Option<String>,
    pub timeout: Duration,
}

impl WorkerJob {
    pub fn new(name: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            work_dir: PathBuf::from("."),
            command: command.into(),
            args: Vec::new(),
            payload: None,
            timeout,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl JobOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes one job in an isolated context.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, job: &WorkerJob) -> impl Future<Output = Result<JobOutput>> + Send;
}

/// Runs jobs as child processes. A job killed by a signal is a crash; a
/// non-zero exit code is a normal result the caller interprets.
#[derive(Debug, Default, Clone)]
pub struct ProcessJobRunner {
    env: Vec<(String, String)>,
}

impl ProcessJobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

impl JobRunner for ProcessJobRunner {
    async fn run(&self, job: &WorkerJob) -> Result<JobOutput> {
        let config = ProcessConfig {
            command: job.command.clone(),
            args: job.args.clone(),
            working_dir: job.work_dir.clone(),
            // The pool enforces the deadline and terminates the group.
            timeout: None,
            log_prefix: format!("job:{}", job.name),
            env: self.env.clone(),
            stdin_data: job.payload.clone(),
        };

        let output = spawn_and_stream(config).await?;
        if let Some(sig) = output.signal {
            return Err(Error::Process(format!(
                "'{}' killed by signal {sig}",
                job.command
            )));
        }

        Ok(JobOutput {
            exit_code: output.exit_code,
            stdout: output.stdout_lines.join("\n"),
            stderr: output.stderr_lines.join("\n"),
        })
    }
}

/// Runs jobs through an in-process async closure.
pub struct FnJobRunner<F> {
    f: F,
}

impl<F> FnJobRunner<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> JobRunner for FnJobRunner<F>
where
    F: Fn(WorkerJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutput>> + Send + 'static,
{
    fn run(&self, job: &WorkerJob) -> impl Future<Output = Result<JobOutput>> + Send {
        (self.f)(job.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub running: usize,
    pub queued: usize,
    pub closed: bool,
}

enum Command {
    Submit {
        job: WorkerJob,
        reply: oneshot::Sender<Result<JobOutput>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Cleanup {
        done: oneshot::Sender<()>,
    },
}

enum Event {
    Finished {
        id: JobId,
        result: Result<JobOutput>,
    },
    TimedOut {
        id: JobId,
    },
}

/// Fixed-size pool of job slots with a FIFO overflow queue.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    workers: usize,
}

impl WorkerPool {
    /// Start the pool's scheduler. Must be called inside a Tokio runtime.
    pub fn new<R: JobRunner>(runner: R, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::ConfigValidation(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            runner: Arc::new(runner),
            workers,
            next_id: 1,
            queue: VecDeque::new(),
            running: HashMap::new(),
            closed: false,
            events,
        };
        tokio::spawn(scheduler.run(command_rx, event_rx));
        info!(workers, "worker pool started");
        Ok(Self { commands, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run a job and wait for its result. Jobs beyond the pool's capacity
    /// wait in FIFO order.
    pub async fn submit(&self, job: WorkerJob) -> Result<JobOutput> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Submit { job, reply }).is_err() {
            return Err(Error::WorkerCancelled { job_id: 0 });
        }
        rx.await
            .unwrap_or(Err(Error::WorkerCancelled { job_id: 0 }))
    }

    pub async fn stats(&self) -> PoolStats {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stats { reply }).is_err() {
            return PoolStats {
                closed: true,
                ..Default::default()
            };
        }
        rx.await.unwrap_or(PoolStats {
            closed: true,
            ..Default::default()
        })
    }

    /// Terminate running jobs, cancel queued ones and close the pool.
    /// Safe to call more than once.
    pub async fn cleanup(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Cleanup { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct QueuedJob {
    id: JobId,
    job: WorkerJob,
    reply: oneshot::Sender<Result<JobOutput>>,
}

struct RunningJob {
    name: String,
    timeout: Duration,
    execution: AbortHandle,
    timer: JoinHandle<()>,
    reply: oneshot::Sender<Result<JobOutput>>,
}

struct Scheduler<R> {
    runner: Arc<R>,
    workers: usize,
    next_id: JobId,
    queue: VecDeque<QueuedJob>,
    running: HashMap<JobId, RunningJob>,
    closed: bool,
    events: mpsc::UnboundedSender<Event>,
}

impl<R: JobRunner> Scheduler<R> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // Every pool handle is gone.
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        debug!("worker pool scheduler stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { job, reply } => {
                let id = self.next_id;
                self.next_id += 1;
                if self.closed {
                    let _ = reply.send(Err(Error::WorkerCancelled { job_id: id }));
                    return;
                }
                debug!(job_id = id, job = %job.name, "job queued");
                self.queue.push_back(QueuedJob { id, job, reply });
                self.start_ready();
            }
            Command::Stats { reply } => {
                let _ = reply.send(PoolStats {
                    running: self.running.len(),
                    queued: self.queue.len(),
                    closed: self.closed,
                });
            }
            Command::Cleanup { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Finished { id, result } => {
                // Removal is the completion flag: a job that already timed
                // out or was cancelled is no longer in the table.
                let Some(job) = self.running.remove(&id) else {
                    debug!(job_id = id, "ignoring completion of finished job");
                    return;
                };
                job.timer.abort();
                match &result {
                    Ok(output) => {
                        info!(job_id = id, job = %job.name, exit_code = output.exit_code, "job finished")
                    }
                    Err(e) => warn!(job_id = id, job = %job.name, error = %e, "job failed"),
                }
                let _ = job.reply.send(result);
                self.start_ready();
            }
            Event::TimedOut { id } => {
                let Some(job) = self.running.remove(&id) else {
                    return;
                };
                warn!(job_id = id, job = %job.name, timeout = ?job.timeout, "job timed out, terminating");
                job.execution.abort();
                let _ = job.reply.send(Err(Error::WorkerTimeout {
                    job_id: id,
                    timeout: job.timeout,
                }));
                self.start_ready();
            }
        }
    }

    fn start_ready(&mut self) {
        while !self.closed && self.running.len() < self.workers {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            self.start(queued);
        }
    }

    fn start(&mut self, queued: QueuedJob) {
        let QueuedJob { id, job, reply } = queued;
        let name = job.name.clone();
        let timeout = job.timeout;
        info!(job_id = id, job = %name, "job started");

        let runner = Arc::clone(&self.runner);
        let execution = tokio::spawn(async move { runner.run(&job).await });
        let abort = execution.abort_handle();

        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match execution.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(Error::WorkerCrash {
                    job_id: id,
                    message: format!("job panicked: {e}"),
                }),
                // Aborted by the scheduler; the outcome is already settled.
                Err(_) => return,
            };
            let result = result.map_err(|e| match e {
                Error::Process(message) => Error::WorkerCrash { job_id: id, message },
                other => other,
            });
            let _ = events.send(Event::Finished { id, result });
        });

        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::TimedOut { id });
        });

        self.running.insert(
            id,
            RunningJob {
                name,
                timeout,
                execution: abort,
                timer,
                reply,
            },
        );
    }

    fn shutdown(&mut self) {
        if !self.closed {
            info!(
                running = self.running.len(),
                queued = self.queue.len(),
                "worker pool shutting down"
            );
        }
        self.closed = true;
        for (id, job) in self.running.drain() {
            job.execution.abort();
            job.timer.abort();
            let _ = job.reply.send(Err(Error::WorkerCancelled { job_id: id }));
        }
        for queued in self.queue.drain(..) {
            let _ = queued
                .reply
                .send(Err(Error::WorkerCancelled { job_id: queued.id }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok(stdout: &str) -> Result<JobOutput> {
        Ok(JobOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    /// Job behaviour is chosen by its command: `hang`, `panic`, `fail`,
    /// `sleep` (payload = millis), anything else echoes its name.
    fn scripted_pool(workers: usize, started: Arc<Mutex<Vec<String>>>) -> WorkerPool {
        let runner = FnJobRunner::new(move |job: WorkerJob| {
            let started = Arc::clone(&started);
            async move {
                started.lock().unwrap().push(job.name.clone());
                match job.command.as_str() {
                    "hang" => std::future::pending().await,
                    "panic" => panic!("job blew up"),
                    "fail" => Err(Error::Process("exit status 3".to_string())),
                    "sleep" => {
                        let ms = job.payload.as_deref().unwrap_or("0").parse().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        ok(&job.name)
                    }
                    _ => ok(&job.name),
                }
            }
        });
        WorkerPool::new(runner, workers).unwrap()
    }

    fn job(name: &str, command: &str) -> WorkerJob {
        WorkerJob::new(name, command, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_submit_returns_output() {
        let pool = scripted_pool(2, Arc::default());
        let out = pool.submit(job("a", "echo")).await.unwrap();
        assert_eq!(out.stdout, "a");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let runner = FnJobRunner::new(|_job: WorkerJob| async { ok("") });
        assert!(WorkerPool::new(runner, 0).is_err());
    }

    #[tokio::test]
    async fn test_queue_is_fifo_beyond_capacity() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let pool = scripted_pool(1, Arc::clone(&started));
        let slow = job("first", "sleep").with_payload("20");
        let (a, b, c) = tokio::join!(
            pool.submit(slow),
            pool.submit(job("second", "echo")),
            pool.submit(job("third", "echo")),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(
            started.lock().unwrap().clone(),
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn test_running_jobs_bounded_by_workers() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let runner = FnJobRunner::new(move |_job: WorkerJob| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                ok("")
            }
        });
        let pool = WorkerPool::new(runner, 2).unwrap();
        let mut handles = Vec::new();
        for i in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.submit(job(&format!("j{i}"), "x")).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_slot_for_next_job() {
        let pool = scripted_pool(1, Arc::default());
        let started = tokio::time::Instant::now();
        let stuck = WorkerJob::new("stuck", "hang", Duration::from_secs(2));
        let (stuck, next) = tokio::join!(pool.submit(stuck), pool.submit(job("next", "echo")));

        match stuck {
            Err(Error::WorkerTimeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_secs(2))
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(next.unwrap().stdout, "next");
        assert!(started.elapsed() < Duration::from_secs(3));

        let stats = pool.stats().await;
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_panicking_job_is_a_crash() {
        let pool = scripted_pool(1, Arc::default());
        let err = pool.submit(job("p", "panic")).await.unwrap_err();
        assert!(matches!(err, Error::WorkerCrash { .. }));
        // The pool keeps serving.
        assert!(pool.submit(job("after", "echo")).await.is_ok());
    }

    #[tokio::test]
    async fn test_process_error_is_a_crash() {
        let pool = scripted_pool(1, Arc::default());
        let err = pool.submit(job("f", "fail")).await.unwrap_err();
        assert!(matches!(err, Error::WorkerCrash { ref message, .. } if message.contains("exit status 3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_cancels_running_and_queued() {
        let pool = scripted_pool(1, Arc::default());
        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(job("running", "hang")).await })
        };
        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(job("queued", "hang")).await })
        };
        while pool.stats().await.queued == 0 {
            tokio::task::yield_now().await;
        }

        pool.cleanup().await;
        assert!(matches!(
            running.await.unwrap(),
            Err(Error::WorkerCancelled { .. })
        ));
        assert!(matches!(
            queued.await.unwrap(),
            Err(Error::WorkerCancelled { .. })
        ));

        // Idempotent, and the pool stays closed.
        pool.cleanup().await;
        assert!(pool.stats().await.closed);
        assert!(matches!(
            pool.submit(job("late", "echo")).await,
            Err(Error::WorkerCancelled { .. })
        ));
    }
}
