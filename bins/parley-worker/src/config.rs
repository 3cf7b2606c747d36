// Language registry and judge configuration for the parley worker
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parley_common::error::SystemError;
use parley_common::types::Language;
use serde::{Deserialize, Serialize};

use crate::sandbox::RunLimits;

/// How one language turns sources into an executable. The compile field is
/// a command template: `{executable}` is substituted in place, `{sources}`
/// expands to the full source list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageCommand {
    pub name: String,
    pub compile: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageCommand>,
}

/// Resolves the concrete compilation command line for a language, loaded
/// from languages.json.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    commands: HashMap<String, Vec<String>>,
}

impl CommandResolver {
    pub fn from_json(content: &str) -> Result<Self> {
        let parsed: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;
        let mut commands = HashMap::new();
        for lang in parsed.languages {
            commands.insert(lang.name, lang.compile);
        }
        Ok(Self { commands })
    }

    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("language config file not found: {}", config_path.display());
        }
        let content =
            std::fs::read_to_string(config_path).context("Failed to read languages.json")?;
        Self::from_json(&content)
    }

    /// Load with default path (config/languages.json)
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("config/languages.json"))
    }

    pub fn list_languages(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    /// Expand the template into a concrete command line.
    pub fn compile_command(
        &self,
        language: Language,
        sources: &[String],
        executable: &str,
    ) -> Result<Vec<String>, SystemError> {
        let template = self
            .commands
            .get(language.source_extension())
            .ok_or_else(|| SystemError::UnknownLanguage(language.to_string()))?;
        let mut command = Vec::with_capacity(template.len() + sources.len());
        for arg in template {
            if arg == "{sources}" {
                command.extend(sources.iter().cloned());
            } else {
                command.push(arg.replace("{executable}", executable));
            }
        }
        Ok(command)
    }
}

/// Everything the orchestrator needs injected at construction: no module
/// globals, no ambient configuration.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Root under which channel directories are allocated.
    pub temp_dir: PathBuf,
    /// Limits for the compilation step.
    pub compile_limits: RunLimits,
    /// Extra wall-clock headroom the manager gets beyond the contestants'.
    pub manager_wall_slack: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            compile_limits: RunLimits {
                cpu: Some(Duration::from_secs(30)),
                wall: Some(Duration::from_secs(60)),
                memory: Some(512 * 1024 * 1024),
            },
            manager_wall_slack: Duration::from_secs(5),
        }
    }
}
