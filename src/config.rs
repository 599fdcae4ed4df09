use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cli::Cli;
use crate::coordinator::RunOptions;
use crate::dedup::DedupConfig;
use crate::error::{Error, Result};
use crate::resolver::ResolvePolicy;
use crate::state::StateManager;
use crate::tasks::{ReviewDimension, TestScenario};

pub const DEFAULT_CONFIG_PATH: &str = "diffsweep.toml";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub state_dir: Option<String>,
    pub prompts_dir: Option<String>,
    pub coordinator: Option<CoordinatorSection>,
    pub pool: Option<PoolSection>,
    pub dedup: Option<DedupSection>,
    pub resolver: Option<ResolverSection>,
    pub completion: Option<CompletionSection>,
    pub embedding: Option<EmbeddingSettings>,
    #[serde(default)]
    pub review: Vec<ReviewDimension>,
    #[serde(default)]
    pub scenario: Vec<TestScenario>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorSection {
    pub max_concurrency: Option<usize>,
    pub continue_on_error: Option<bool>,
    pub retry_on_error: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PoolSection {
    pub workers: Option<usize>,
    pub job_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DedupSection {
    pub signature_prefix_len: Option<usize>,
    pub similarity_threshold: Option<f64>,
    pub vector_exact_threshold: Option<f64>,
    pub vector_nearby_threshold: Option<f64>,
    pub nearby_window: Option<u32>,
    pub message_weight: Option<f64>,
    pub suggestion_weight: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResolverSection {
    pub fuzzy: Option<bool>,
    pub prefer_added: Option<bool>,
    pub token_overlap_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CompletionSection {
    pub kind: Option<String>,
    pub binary: Option<String>,
    pub args: Option<Vec<String>>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionKind {
    #[default]
    Command,
    Http,
}

impl CompletionKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "command" => Ok(CompletionKind::Command),
            "http" => Ok(CompletionKind::Http),
            other => Err(Error::ConfigValidation(format!(
                "unknown completion kind: {other} (expected: command, http)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub kind: CompletionKind,
    pub binary: Option<String>,
    pub args: Vec<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            kind: CompletionKind::Command,
            binary: Some("claude".to_string()),
            args: vec!["--print".to_string()],
            url: None,
            model: None,
            api_key_env: None,
            timeout_secs: 300,
        }
    }
}

fn default_embedding_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingSettings {
    pub url: String,
    #[serde(default)]
    pub model: String,
    pub api_key_env: Option<String>,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub workers: usize,
    pub job_timeout: Duration,
}

/// Fully resolved configuration: CLI flags over the config file over
/// defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub state_dir: PathBuf,
    pub prompts_dir: Option<PathBuf>,
    pub run: RunOptions,
    pub pool: PoolSettings,
    pub dedup: DedupConfig,
    pub resolver: ResolvePolicy,
    pub completion: CompletionSettings,
    pub embedding: Option<EmbeddingSettings>,
    pub reviews: Vec<ReviewDimension>,
    pub scenarios: Vec<TestScenario>,
}

/// Values the command line may override.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub max_concurrency: Option<usize>,
    pub workers: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    pub state_dir: Option<String>,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let file_config = match cli.config.as_deref() {
            Some(explicit) => {
                let path = Path::new(explicit);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    parse_config(&std::fs::read_to_string(path)?)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        merge(file_config, &cli.overrides())
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn check_fraction(name: &str, value: Option<f64>) -> Result<()> {
    if let Some(v) = value
        && !(0.0..=1.0).contains(&v)
    {
        return Err(Error::ConfigValidation(format!(
            "{name} must be between 0 and 1, got {v}"
        )));
    }
    Ok(())
}

fn check_positive<T: PartialEq + Default>(name: &str, value: Option<T>) -> Result<()> {
    if let Some(v) = value
        && v == T::default()
    {
        return Err(Error::ConfigValidation(format!("{name} must be > 0")));
    }
    Ok(())
}

fn validate(config: &ConfigFile) -> Result<()> {
    if let Some(ref c) = config.coordinator {
        check_positive("coordinator.max_concurrency", c.max_concurrency)?;
    }
    if let Some(ref p) = config.pool {
        check_positive("pool.workers", p.workers)?;
        check_positive("pool.job_timeout_secs", p.job_timeout_secs)?;
    }
    if let Some(ref d) = config.dedup {
        check_fraction("dedup.similarity_threshold", d.similarity_threshold)?;
        check_fraction("dedup.vector_exact_threshold", d.vector_exact_threshold)?;
        check_fraction("dedup.vector_nearby_threshold", d.vector_nearby_threshold)?;
        check_fraction("dedup.message_weight", d.message_weight)?;
        check_fraction("dedup.suggestion_weight", d.suggestion_weight)?;
        check_positive("dedup.signature_prefix_len", d.signature_prefix_len)?;
    }
    if let Some(ref r) = config.resolver {
        check_fraction("resolver.token_overlap_threshold", r.token_overlap_threshold)?;
    }
    if let Some(ref c) = config.completion {
        if let Some(ref kind) = c.kind {
            CompletionKind::parse(kind)?;
        }
        check_positive("completion.timeout_secs", c.timeout_secs)?;
    }
    if let Some(ref e) = config.embedding {
        check_positive("embedding.timeout_secs", Some(e.timeout_secs))?;
    }

    let mut names = HashSet::new();
    let all_names = config
        .review
        .iter()
        .map(|r| r.name.as_str())
        .chain(config.scenario.iter().map(|s| s.name.as_str()));
    for name in all_names {
        if name.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "review and scenario names must not be empty".to_string(),
            ));
        }
        if !names.insert(name) {
            return Err(Error::ConfigValidation(format!(
                "duplicate task name: {name}"
            )));
        }
    }
    Ok(())
}

pub fn merge(file: ConfigFile, cli: &Overrides) -> Result<Config> {
    let coordinator = file.coordinator.unwrap_or_default();
    let defaults = RunOptions::default();
    let run = RunOptions {
        max_concurrency: cli
            .max_concurrency
            .or(coordinator.max_concurrency)
            .unwrap_or(defaults.max_concurrency),
        continue_on_error: coordinator
            .continue_on_error
            .unwrap_or(defaults.continue_on_error),
        retry_on_error: coordinator
            .retry_on_error
            .unwrap_or(defaults.retry_on_error),
        max_retries: coordinator.max_retries.unwrap_or(defaults.max_retries),
        retry_backoff: coordinator
            .retry_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff),
    };

    let pool_section = file.pool.unwrap_or_default();
    let pool = PoolSettings {
        workers: cli.workers.or(pool_section.workers).unwrap_or(2),
        job_timeout: Duration::from_secs(
            cli.job_timeout_secs
                .or(pool_section.job_timeout_secs)
                .unwrap_or(600),
        ),
    };

    let d = file.dedup.unwrap_or_default();
    let dd = DedupConfig::default();
    let dedup = DedupConfig {
        signature_prefix_len: d.signature_prefix_len.unwrap_or(dd.signature_prefix_len),
        similarity_threshold: d.similarity_threshold.unwrap_or(dd.similarity_threshold),
        vector_exact_threshold: d.vector_exact_threshold.unwrap_or(dd.vector_exact_threshold),
        vector_nearby_threshold: d
            .vector_nearby_threshold
            .unwrap_or(dd.vector_nearby_threshold),
        nearby_window: d.nearby_window.unwrap_or(dd.nearby_window),
        message_weight: d.message_weight.unwrap_or(dd.message_weight),
        suggestion_weight: d.suggestion_weight.unwrap_or(dd.suggestion_weight),
    };

    let r = file.resolver.unwrap_or_default();
    let rd = ResolvePolicy::default();
    let resolver = ResolvePolicy {
        fuzzy: r.fuzzy.unwrap_or(rd.fuzzy),
        prefer_added: r.prefer_added.unwrap_or(rd.prefer_added),
        token_overlap_threshold: r
            .token_overlap_threshold
            .unwrap_or(rd.token_overlap_threshold),
    };

    let c = file.completion.unwrap_or_default();
    let cd = CompletionSettings::default();
    let completion = CompletionSettings {
        kind: match c.kind.as_deref() {
            Some(kind) => CompletionKind::parse(kind)?,
            None => cd.kind,
        },
        binary: c.binary.or(cd.binary),
        args: c.args.unwrap_or(cd.args),
        url: c.url,
        model: c.model,
        api_key_env: c.api_key_env,
        timeout_secs: c.timeout_secs.unwrap_or(cd.timeout_secs),
    };

    let config = Config {
        state_dir: cli
            .state_dir
            .clone()
            .or(file.state_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| StateManager::default_dir(Path::new("."))),
        prompts_dir: file.prompts_dir.map(PathBuf::from),
        run,
        pool,
        dedup,
        resolver,
        completion,
        embedding: file.embedding,
        reviews: file.review,
        scenarios: file.scenario,
    };
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Checks that also cover values supplied on the command line.
    fn validate(&self) -> Result<()> {
        if self.run.max_concurrency == 0 {
            return Err(Error::ConfigValidation(
                "max_concurrency must be > 0".to_string(),
            ));
        }
        if self.pool.workers == 0 {
            return Err(Error::ConfigValidation("workers must be > 0".to_string()));
        }
        if self.pool.job_timeout.is_zero() {
            return Err(Error::ConfigValidation(
                "job timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
