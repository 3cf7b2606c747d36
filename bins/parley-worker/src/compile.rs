//! Compilation orchestration: one sandboxed compilation per submission,
//! assembling the author's stub, the contestant's sources and any headers
//! into the `user_program` executable.

use parley_common::error::SystemError;
use parley_common::types::{CompilationResult, Digest, Job};
use tracing::{info, instrument, warn};

use crate::config::{CommandResolver, JudgeConfig};
use crate::sandbox::{Disposition, RunSpec, Sandbox, SandboxProvider, STDERR_FILE, STDOUT_FILE};

/// Name of the compiled contestant executable, inside the compilation
/// sandbox and later inside each contestant sandbox.
pub const EXECUTABLE_NAME: &str = "user_program";

/// Compile one submission. A submission that does not match the declared
/// shape, or that fails to compile, is a contestant-attributable failure
/// carried in the result; only infrastructure problems become errors.
#[instrument(skip_all, fields(submission = %job.submission, language = %job.language))]
pub async fn compile(
    provider: &dyn SandboxProvider,
    resolver: &CommandResolver,
    cfg: &JudgeConfig,
    job: &Job,
) -> Result<CompilationResult, SystemError> {
    // Shape check before any sandbox is spent.
    if job.files.len() != job.submission_format.len() {
        warn!(
            submitted = job.files.len(),
            expected = job.submission_format.len(),
            "submission shape mismatch"
        );
        return Ok(CompilationResult::failure("Invalid files in submission"));
    }

    // Sources: stub first, then the submission under its substituted names.
    let stub = job.language.stub_filename();
    let stub_digest = job
        .managers
        .get(&stub)
        .ok_or_else(|| SystemError::MissingArtifact(stub.clone()))?;
    let mut sources = vec![stub.clone()];
    let mut files = vec![(stub, stub_digest.clone())];
    for (role, digest) in &job.files {
        let filename = job.language.substitute(role);
        sources.push(filename.clone());
        files.push((filename, digest.clone()));
    }
    // Headers are materialized next to the sources for the compiler to pick
    // up; they are not passed on the command line.
    let header_suffix = format!(".{}", job.language.header_suffix());
    for (name, digest) in &job.managers {
        if name.ends_with(&header_suffix) {
            files.push((name.clone(), digest.clone()));
        }
    }

    let command = resolver.compile_command(job.language, &sources, EXECUTABLE_NAME)?;

    let sandbox = provider.acquire().await?;
    let result = run_compilation(sandbox.as_ref(), cfg, job, &files, command).await;
    if let Err(err) = sandbox.release().await {
        warn!(%err, "failed to release compilation sandbox");
    }
    result
}

async fn run_compilation(
    sandbox: &dyn Sandbox,
    cfg: &JudgeConfig,
    job: &Job,
    files: &[(String, Digest)],
    command: Vec<String>,
) -> Result<CompilationResult, SystemError> {
    for (name, digest) in files {
        sandbox.provision(name, digest, false).await?;
    }

    let process = sandbox
        .start(RunSpec {
            command,
            limits: cfg.compile_limits.clone(),
            allow_dirs: Vec::new(),
            stdin: None,
        })
        .await?;
    let execution = process.wait().await?;

    match execution.disposition {
        Disposition::Exited(0) => {
            let executable = sandbox
                .export(
                    EXECUTABLE_NAME,
                    &format!("Executable {EXECUTABLE_NAME} for {}", job.info),
                )
                .await?;
            info!("compilation succeeded");
            Ok(CompilationResult {
                success: true,
                compiled: true,
                executable: Some(executable),
                text: diagnostics(sandbox).await,
                stats: Some(execution.stats),
            })
        }
        Disposition::Exited(code) => {
            info!(code, "compilation failed");
            Ok(CompilationResult {
                success: true,
                compiled: false,
                executable: None,
                text: diagnostics(sandbox).await,
                stats: Some(execution.stats),
            })
        }
        Disposition::TimedOut | Disposition::WallClockTimedOut => {
            info!("compilation timed out");
            Ok(CompilationResult {
                success: true,
                compiled: false,
                executable: None,
                text: "Compilation timed out".to_string(),
                stats: Some(execution.stats),
            })
        }
        Disposition::MemoryExceeded => Ok(CompilationResult {
            success: true,
            compiled: false,
            executable: None,
            text: "Compilation exceeded the memory limit".to_string(),
            stats: Some(execution.stats),
        }),
        Disposition::Signaled(signal) => Ok(CompilationResult {
            success: true,
            compiled: false,
            executable: None,
            text: format!("Compilation killed with signal {signal}"),
            stats: Some(execution.stats),
        }),
    }
}

/// Compiler stderr, falling back to stdout when stderr is empty.
async fn diagnostics(sandbox: &dyn Sandbox) -> String {
    for name in [STDERR_FILE, STDOUT_FILE] {
        if let Ok(bytes) = sandbox.read_file(name).await {
            let text = String::from_utf8_lossy(&bytes).trim().to_string();
            if !text.is_empty() {
                return text;
            }
        }
    }
    String::new()
}
