mod channels;
mod compile;
mod config;
mod evaluator;
mod executor;
mod interactive;
mod sandbox;
mod storage;
#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use parley_common::types::Job;
use tracing::{error, info};

use crate::config::{CommandResolver, JudgeConfig};
use crate::executor::Communication;
use crate::sandbox::LocalSandboxProvider;
use crate::storage::FileStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("parley worker booting...");

    let job_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("JOB_FILE").ok())
        .context("usage: parley-worker <job.json> (or set JOB_FILE)")?;

    let store_dir = env_path("STORE_DIR", "store");
    let temp_dir = std::env::var("TEMP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());

    let resolver = match std::env::var("LANGUAGES_JSON") {
        Ok(path) => CommandResolver::load(PathBuf::from(path).as_path()),
        Err(_) => CommandResolver::load_default(),
    }
    .map_err(|err| {
        error!("failed to load language configuration: {err}");
        error!("make sure config/languages.json exists");
        err
    })?;
    info!(languages = ?resolver.list_languages(), "loaded language configurations");

    let store = FileStore::open(&store_dir)?;
    info!(store = %store_dir.display(), temp = %temp_dir.display(), "storage ready");

    let cfg = JudgeConfig {
        temp_dir: temp_dir.clone(),
        ..JudgeConfig::default()
    };
    let provider = Arc::new(LocalSandboxProvider::new(temp_dir, store));
    let task = Communication::new(provider, resolver, cfg);

    let raw = tokio::fs::read_to_string(&job_path)
        .await
        .with_context(|| format!("cannot read job file {job_path}"))?;
    let job: Job = serde_json::from_str(&raw).context("malformed job file")?;

    info!(
        submission = %job.submission,
        language = %job.language,
        testcases = job.testcases.len(),
        "received job"
    );

    match executor::run_job(&task, &job).await {
        Ok(report) => {
            info!(
                submission = %report.submission,
                compiled = report.compilation.compiled,
                evaluations = report.evaluations.len(),
                "job complete"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            // System fault: no score was produced; the attempt is eligible
            // for retry by whoever scheduled it.
            error!(%err, "job attempt failed");
            std::process::exit(1);
        }
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
