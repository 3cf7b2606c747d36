//! The interactive run orchestrator: one manager and two contestant
//! processes wired through two channel pairs, started concurrently and
//! waited on as a single group.
//!
//! Launch order and concurrency are load-bearing. Opening a named pipe
//! blocks until the peer opens the other end, so all three processes must
//! exist before the orchestrator waits on any of them; the joint wait is the
//! only blocking point, bounded by each process's sandbox-enforced limits.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future;
use parley_common::error::SystemError;
use parley_common::types::{Digest, EvaluationResult, Job, Testcase};
use tracing::{info, instrument, warn};

use crate::channels::ChannelPair;
use crate::compile::EXECUTABLE_NAME;
use crate::config::JudgeConfig;
use crate::evaluator::{self, Judgment};
use crate::sandbox::{
    acquire_many, release_all, RunLimits, RunSpec, Sandbox, SandboxProvider,
};

pub const MANAGER_NAME: &str = "manager";
pub const INPUT_NAME: &str = "input.txt";
pub const OUTPUT_NAME: &str = "output.txt";

/// Floor for the manager's CPU allowance: a trusted manager brokering a slow
/// exchange must not be starved by a tight contestant limit.
const MANAGER_MIN_CPU: Duration = Duration::from_secs(10);

/// Evaluate one testcase. On return, whatever happened, every sandbox
/// acquired here has been released and both channel directories are gone.
#[instrument(skip_all, fields(submission = %job.submission, testcase = testcase.index))]
pub async fn evaluate_testcase(
    provider: &dyn SandboxProvider,
    cfg: &JudgeConfig,
    job: &Job,
    executable: &Digest,
    testcase: &Testcase,
) -> Result<EvaluationResult, SystemError> {
    // Channels before sandboxes: their Drop removes the directories if
    // anything below fails before the explicit close.
    let first_pair = ChannelPair::allocate(&cfg.temp_dir, 1)?;
    let second_pair = ChannelPair::allocate(&cfg.temp_dir, 2)?;

    let boxes = acquire_many(provider, 3).await?;

    let outcome = run_testcase(&boxes, (&first_pair, &second_pair), cfg, job, executable, testcase)
        .await;

    release_all(&boxes).await;
    for (pair, k) in [(first_pair, 1), (second_pair, 2)] {
        if let Err(err) = pair.close() {
            warn!(pair = k, %err, "failed to remove channel directory");
        }
    }

    outcome
}

async fn run_testcase(
    boxes: &[Arc<dyn Sandbox>],
    pairs: (&ChannelPair, &ChannelPair),
    cfg: &JudgeConfig,
    job: &Job,
    executable: &Digest,
    testcase: &Testcase,
) -> Result<EvaluationResult, SystemError> {
    let (manager_box, first_box, second_box) = (&boxes[0], &boxes[1], &boxes[2]);
    let (first_pair, second_pair) = pairs;

    // Setup: manager binary and testcase input into the manager sandbox, the
    // compiled executable into each contestant sandbox.
    let manager_digest = job
        .managers
        .get(MANAGER_NAME)
        .ok_or_else(|| SystemError::MissingArtifact(MANAGER_NAME.to_string()))?;
    manager_box.provision(MANAGER_NAME, manager_digest, true).await?;
    manager_box.provision(INPUT_NAME, &testcase.input, false).await?;
    first_box.provision(EXECUTABLE_NAME, executable, true).await?;
    second_box.provision(EXECUTABLE_NAME, executable, true).await?;

    // Launch: manager, then both contestants, with no wait in between.
    let manager_proc = manager_box
        .start(manager_spec(job, cfg, first_pair, second_pair))
        .await?;
    let first_proc = first_box.start(contestant_spec(job, 0, first_pair)).await?;
    let second_proc = second_box
        .start(contestant_spec(job, 1, second_pair))
        .await?;

    // Joint wait: one barrier for the whole group. Completion order is
    // irrelevant; each process is bounded by its own sandbox limits.
    let (manager_run, first_run, second_run) =
        future::join3(manager_proc.wait(), first_proc.wait(), second_proc.wait()).await;
    let manager_run = manager_run?;
    let first_run = first_run?;
    let second_run = second_run?;

    let judgment = evaluator::classify(&manager_run, &first_run, &second_run)?;
    let (outcome, text) = match judgment {
        Judgment::Rejected { text } => (0.0, text),
        Judgment::Clean => {
            let verdict = evaluator::extract_verdict(manager_box.as_ref()).await?;
            (verdict.outcome, verdict.text)
        }
    };

    let output = capture_output(manager_box.as_ref(), job, testcase).await?;

    info!(outcome, "testcase evaluated");
    Ok(EvaluationResult {
        testcase: testcase.index,
        success: true,
        outcome: Some(evaluator::format_outcome(outcome)),
        text,
        output,
        first_stats: first_run.stats,
        second_stats: second_run.stats,
        manager_stats: manager_run.stats,
    })
}

fn manager_spec(
    job: &Job,
    cfg: &JudgeConfig,
    first: &ChannelPair,
    second: &ChannelPair,
) -> RunSpec {
    RunSpec {
        command: vec![
            format!("./{MANAGER_NAME}"),
            path_arg(first.fifo_in()),
            path_arg(first.fifo_out()),
            path_arg(second.fifo_in()),
            path_arg(second.fifo_out()),
        ],
        limits: manager_limits(job, cfg),
        // The manager sees both channel directories; nobody else does.
        allow_dirs: vec![first.dir().to_path_buf(), second.dir().to_path_buf()],
        stdin: Some(INPUT_NAME.to_string()),
    }
}

fn contestant_spec(job: &Job, index: usize, pair: &ChannelPair) -> RunSpec {
    RunSpec {
        // The index token tells the program which of the two roles it plays.
        command: vec![
            format!("./{EXECUTABLE_NAME}"),
            index.to_string(),
            path_arg(pair.fifo_out()),
            path_arg(pair.fifo_in()),
        ],
        limits: contestant_limits(job),
        allow_dirs: vec![pair.dir().to_path_buf()],
        stdin: None,
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn contestant_limits(job: &Job) -> RunLimits {
    let cpu = Duration::from_secs_f64(job.time_limit);
    RunLimits {
        cpu: Some(cpu),
        wall: Some(contestant_wall(job)),
        memory: Some(job.memory_limit),
    }
}

fn contestant_wall(job: &Job) -> Duration {
    Duration::from_secs_f64(job.time_limit) * 2 + Duration::from_secs(1)
}

/// The manager is trusted: the contestant memory ceiling does not apply to
/// it, but it still runs under operational time limits so a wedged manager
/// cannot hang the host.
fn manager_limits(job: &Job, cfg: &JudgeConfig) -> RunLimits {
    let cpu = Duration::from_secs_f64(job.time_limit).max(MANAGER_MIN_CPU);
    RunLimits {
        cpu: Some(cpu),
        wall: Some(contestant_wall(job) + cfg.manager_wall_slack),
        memory: None,
    }
}

async fn capture_output(
    manager_box: &dyn Sandbox,
    job: &Job,
    testcase: &Testcase,
) -> Result<Option<Digest>, SystemError> {
    if !job.get_output {
        return Ok(None);
    }
    if !manager_box.file_exists(OUTPUT_NAME).await {
        // Recorded as "no output", not an error.
        info!("output requested but the manager produced none");
        return Ok(None);
    }
    let digest = manager_box
        .export(
            OUTPUT_NAME,
            &format!(
                "Output file for testcase {} in job {}",
                testcase.index, job.info
            ),
        )
        .await?;
    Ok(Some(digest))
}
