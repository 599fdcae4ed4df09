use std::io::{Read, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use diffsweep::cli::{Cli, CliCommand, ReviewArgs};
use diffsweep::completion::{AnyCompletion, HttpEncoder};
use diffsweep::config::Config;
use diffsweep::diff::{parse_diff, parse_file_diff};
use diffsweep::error::{Error, Result};
use diffsweep::fingerprint::Fingerprint;
use diffsweep::pipeline::{JsonPublisher, Pipeline};
use diffsweep::pool::{ProcessJobRunner, WorkerJob, WorkerPool};
use diffsweep::prompts::PromptEngine;
use diffsweep::resolver::{LineResolver, ResolvePolicy};
use diffsweep::state::StateManager;
use diffsweep::tasks::AnalysisHandler;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(&cli)?;

    match cli.command {
        CliCommand::Review(args) => review(args, config).await,
        CliCommand::Resolve {
            diff,
            file,
            snippet,
            exact,
            no_prefer_added,
        } => {
            let policy = ResolvePolicy {
                fuzzy: config.resolver.fuzzy && !exact,
                prefer_added: config.resolver.prefer_added && !no_prefer_added,
                ..config.resolver
            };
            resolve(&diff, &file, &snippet, policy)
        }
        CliCommand::Fingerprint { diff } => {
            let parsed = parse_diff(&read_input(&diff)?)?;
            println!("{}", Fingerprint::of(&parsed));
            Ok(0)
        }
        CliCommand::Exec { dir, command, .. } => exec(&config, dir, &command).await,
    }
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    Ok(std::fs::read_to_string(path)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Schema(format!("failed to encode output: {e}")))?;
    println!("{text}");
    Ok(())
}

async fn review(args: ReviewArgs, config: Config) -> Result<i32> {
    let text = read_input(&args.diff)?;
    let raw = match (&args.old_path, &args.new_path) {
        (Some(old), Some(new)) => parse_file_diff(&text, old, new)?.render(),
        _ => text,
    };

    let repo_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let pool = WorkerPool::new(ProcessJobRunner::new(), config.pool.workers)?;
    let handler = AnalysisHandler::new(
        AnyCompletion::from_settings(&config.completion)?,
        PromptEngine::new(config.prompts_dir.clone())?,
    )
    .with_pool(pool.clone(), repo_root, config.pool.job_timeout);

    let encoder = config.embedding.as_ref().map(HttpEncoder::from_settings);
    let sink: Box<dyn Write + Send> = match &args.publish {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::sink()),
    };
    let pipeline = Pipeline::new(
        &config,
        handler,
        encoder,
        StateManager::new(&config.state_dir),
        JsonPublisher::new(sink),
    )?;

    info!(change_id = %args.change_id, "reviewing change");
    let report = pipeline.run(&args.change_id, &raw, args.full).await;
    pool.cleanup().await;
    let report = report?;

    print_json(&report)?;
    Ok(if report.aborted { 2 } else { 0 })
}

fn resolve(diff_path: &str, file: &str, snippet: &str, policy: ResolvePolicy) -> Result<i32> {
    let diff = parse_diff(&read_input(diff_path)?)?;
    let resolver = LineResolver::new(policy);

    let old_side = resolver.is_only_in_removed_lines(&diff, file, snippet);
    let resolution = if old_side {
        resolver.resolve_removed(&diff, file, snippet)
    } else {
        resolver.resolve(&diff, file, snippet)
    };
    let resolution = resolution.ok_or_else(|| Error::UnresolvedLocation {
        file: file.to_string(),
        snippet: snippet.to_string(),
    })?;

    print_json(&serde_json::json!({
        "file": file,
        "is_old_file": old_side,
        "line": resolution.line,
        "kind": resolution.kind,
        "score": resolution.score,
    }))?;
    Ok(0)
}

async fn exec(config: &Config, dir: Option<String>, command: &[String]) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        return Err(Error::ConfigValidation("no command given".to_string()));
    };

    let pool = WorkerPool::new(ProcessJobRunner::new(), config.pool.workers)?;
    let job = WorkerJob::new("exec", program.clone(), config.pool.job_timeout)
        .with_args(args.to_vec())
        .with_work_dir(dir.unwrap_or_else(|| ".".to_string()));
    let result = pool.submit(job).await;
    pool.cleanup().await;

    let output = result?;
    if !output.stdout.is_empty() {
        println!("{}", output.stdout);
    }
    Ok(output.exit_code)
}
