//! Outcome classification.
//!
//! Pure decisions over the three processes' exit conditions, plus verdict
//! extraction from a finished manager sandbox. Knows nothing about how
//! processes were run, which keeps every branch unit-testable.

use parley_common::error::SystemError;

use crate::sandbox::{Disposition, Execution, Sandbox, STDOUT_FILE};

/// Human-readable rendering of a limit or behaviour violation.
pub fn violation_text(disposition: &Disposition) -> String {
    match disposition {
        Disposition::TimedOut => "Execution timed out".to_string(),
        Disposition::WallClockTimedOut => {
            "Execution timed out (wall clock limit exceeded)".to_string()
        }
        Disposition::MemoryExceeded => "Execution exceeded the memory limit".to_string(),
        Disposition::Signaled(signal) => format!("Execution killed with signal {signal}"),
        Disposition::Exited(_) => {
            "Execution failed because the return code was nonzero".to_string()
        }
    }
}

/// What the joint wait produced, before the manager's verdict is consulted.
#[derive(Debug, PartialEq)]
pub enum Judgment {
    /// A contestant failed its own contract: outcome 0.0, and the manager's
    /// output is discarded.
    Rejected { text: String },
    /// All three processes ran cleanly; the manager's verdict stands.
    Clean,
}

/// Decision order, first match wins: contestant violations (first process
/// before second), then the manager's own health. Sandbox-internal failures
/// never reach this function: they surface as `SystemError` from the wait.
pub fn classify(
    manager: &Execution,
    first: &Execution,
    second: &Execution,
) -> Result<Judgment, SystemError> {
    if !first.disposition.is_clean() {
        return Ok(Judgment::Rejected {
            text: violation_text(&first.disposition),
        });
    }
    if !second.disposition.is_clean() {
        return Ok(Judgment::Rejected {
            text: violation_text(&second.disposition),
        });
    }
    if !manager.disposition.is_clean() {
        return Err(SystemError::ManagerFailed(violation_text(
            &manager.disposition,
        )));
    }
    Ok(Judgment::Clean)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub outcome: f64,
    pub text: String,
}

/// Parse the manager's two-line verdict: a number in [0, 1], then the
/// explanation. Anything else is a malformed verdict, which is a system
/// fault (the manager is trusted code; if it misbehaves, the attempt is
/// retried, not scored).
pub fn parse_verdict(raw: &str) -> Result<Verdict, SystemError> {
    let mut lines = raw.lines();
    let outcome_line = lines.next().map(str::trim).unwrap_or("");
    if outcome_line.is_empty() {
        return Err(SystemError::Verdict("empty verdict".to_string()));
    }
    let outcome: f64 = outcome_line
        .parse()
        .map_err(|_| SystemError::Verdict(format!("outcome is not a number: {outcome_line:?}")))?;
    if !(0.0..=1.0).contains(&outcome) {
        return Err(SystemError::Verdict(format!(
            "outcome {outcome} out of range"
        )));
    }
    let text = lines.next().unwrap_or("").trim().to_string();
    Ok(Verdict { outcome, text })
}

/// Read and parse the verdict the manager wrote on its standard output.
pub async fn extract_verdict(sandbox: &dyn Sandbox) -> Result<Verdict, SystemError> {
    let raw = sandbox
        .read_file(STDOUT_FILE)
        .await
        .map_err(|_| SystemError::Verdict("manager produced no verdict".to_string()))?;
    parse_verdict(&String::from_utf8_lossy(&raw))
}

/// Format an outcome the way it travels on the wire: always with a decimal
/// point, no trailing noise ("0.0", "0.73", "1.0").
pub fn format_outcome(outcome: f64) -> String {
    if outcome.fract() == 0.0 {
        format!("{outcome:.1}")
    } else {
        outcome.to_string()
    }
}
