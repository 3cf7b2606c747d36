//! Job execution glue.
//!
//! `TaskType` is the closed contract every task variant implements; this
//! crate ships the communication variant in depth. `run_job` drives one
//! submission through compile-once-then-evaluate without knowing how either
//! step works.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parley_common::error::SystemError;
use parley_common::types::{CompilationResult, Digest, EvaluationResult, Job, JobReport};
use tracing::{info, instrument};

use crate::compile;
use crate::config::{CommandResolver, JudgeConfig};
use crate::interactive;
use crate::sandbox::SandboxProvider;

/// The per-task-type contract. Batch or output-only task types would be
/// further implementations behind this same seam.
#[async_trait]
pub trait TaskType: Send + Sync {
    async fn compile(&self, job: &Job) -> Result<CompilationResult, SystemError>;

    async fn evaluate_testcase(
        &self,
        job: &Job,
        executable: &Digest,
        index: usize,
    ) -> Result<EvaluationResult, SystemError>;
}

/// Two contestant processes brokered by a trusted manager over named pipes.
pub struct Communication {
    provider: Arc<dyn SandboxProvider>,
    resolver: CommandResolver,
    cfg: JudgeConfig,
}

impl Communication {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        resolver: CommandResolver,
        cfg: JudgeConfig,
    ) -> Self {
        Self {
            provider,
            resolver,
            cfg,
        }
    }
}

#[async_trait]
impl TaskType for Communication {
    async fn compile(&self, job: &Job) -> Result<CompilationResult, SystemError> {
        compile::compile(self.provider.as_ref(), &self.resolver, &self.cfg, job).await
    }

    async fn evaluate_testcase(
        &self,
        job: &Job,
        executable: &Digest,
        index: usize,
    ) -> Result<EvaluationResult, SystemError> {
        let testcase = job
            .testcases
            .get(index)
            .ok_or_else(|| SystemError::InvalidJob(format!("no testcase at index {index}")))?;
        interactive::evaluate_testcase(self.provider.as_ref(), &self.cfg, job, executable, testcase)
            .await
    }
}

fn validate(job: &Job) -> Result<(), SystemError> {
    if !job.time_limit.is_finite() || job.time_limit <= 0.0 {
        return Err(SystemError::InvalidJob(format!(
            "time limit must be positive, got {}",
            job.time_limit
        )));
    }
    if job.memory_limit == 0 {
        return Err(SystemError::InvalidJob(
            "memory limit must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Compile once, then evaluate every testcase in order. A `SystemError`
/// aborts the attempt for the caller to retry; contestant faults are data in
/// the report, never errors.
#[instrument(skip_all, fields(submission = %job.submission))]
pub async fn run_job(task: &dyn TaskType, job: &Job) -> Result<JobReport, SystemError> {
    validate(job)?;
    info!(
        language = %job.language,
        testcases = job.testcases.len(),
        "starting job"
    );

    let compilation = task.compile(job).await?;

    let mut evaluations = Vec::new();
    match compilation.executable.clone() {
        Some(executable) => {
            for index in 0..job.testcases.len() {
                info!(testcase = job.testcases[index].index, "evaluating testcase");
                evaluations.push(task.evaluate_testcase(job, &executable, index).await?);
            }
        }
        None => {
            info!("compilation did not produce an executable; skipping evaluation");
        }
    }

    info!(evaluations = evaluations.len(), "job finished");
    Ok(JobReport {
        submission: job.submission,
        compilation,
        evaluations,
        completed_at: Utc::now(),
    })
}
