use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content address of a blob in the store: lowercase hex SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(pub String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "c")]
    C,
    #[serde(rename = "cpp")]
    Cpp,
    #[serde(rename = "pas")]
    Pascal,
}

impl Language {
    /// Extension substituted for the `%l` placeholder in submission roles.
    pub fn source_extension(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Pascal => "pas",
        }
    }

    /// A manager artifact is a header for this language iff its name ends
    /// with `.<suffix>`.
    pub fn header_suffix(&self) -> &'static str {
        match self {
            Language::C | Language::Cpp => "h",
            Language::Pascal => "lib.pas",
        }
    }

    /// Name of the author-supplied stub source for this language.
    pub fn stub_filename(&self) -> String {
        format!("stub.{}", self.source_extension())
    }

    /// Substitute the `%l` placeholder in a submission role name.
    pub fn substitute(&self, role: &str) -> String {
        role.replace("%l", self.source_extension())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_extension())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(Language::C),
            "cpp" => Ok(Language::Cpp),
            "pas" => Ok(Language::Pascal),
            other => Err(format!("unknown language: {other}")),
        }
    }
}

/// One submission against one task: everything the worker needs to compile
/// the contestant's sources and evaluate the task's testcases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub submission: Uuid,
    /// Human-readable label used in artifact descriptions and logs.
    pub info: String,
    pub language: Language,
    /// Declared submission shape: role names with `%l` placeholders.
    pub submission_format: Vec<String>,
    /// Submitted files, role name -> blob.
    pub files: BTreeMap<String, Digest>,
    /// Author-supplied artifacts: `manager`, `stub.<ext>`, headers.
    pub managers: BTreeMap<String, Digest>,
    /// Per contestant process, in seconds.
    pub time_limit: f64,
    /// Per contestant process, in bytes.
    pub memory_limit: u64,
    pub testcases: Vec<Testcase>,
    /// Capture the manager's `output.txt` into the store after each run.
    pub get_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testcase {
    pub index: u32,
    pub input: Digest,
    pub output: Option<Digest>,
}

/// Resource figures for one finished process. Fields the backend cannot
/// measure are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub wall_time_ms: u64,
    pub cpu_time_ms: Option<u64>,
    pub memory_kib: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationResult {
    /// The compilation step itself completed (independent of the verdict).
    pub success: bool,
    /// The sources compiled into an executable.
    pub compiled: bool,
    pub executable: Option<Digest>,
    /// Diagnostics shown to the contestant.
    pub text: String,
    pub stats: Option<RunStats>,
}

impl CompilationResult {
    /// A contestant-attributable compilation failure.
    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            success: true,
            compiled: false,
            executable: None,
            text: text.into(),
            stats: None,
        }
    }
}

/// One testcase's evaluation. `success` reports system-level completion and
/// is independent of the score: a contestant fault is a successful
/// evaluation with outcome 0.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub testcase: u32,
    pub success: bool,
    /// Number in [0, 1] formatted as text, or absent on a system fault.
    pub outcome: Option<String>,
    pub text: String,
    pub output: Option<Digest>,
    pub first_stats: RunStats,
    pub second_stats: RunStats,
    pub manager_stats: RunStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub submission: Uuid,
    pub compilation: CompilationResult,
    pub evaluations: Vec<EvaluationResult>,
    pub completed_at: DateTime<Utc>,
}
