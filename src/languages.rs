//! Language profile registry
//!
//! Static mapping from a language identifier to its sandbox image, commands and
//! default limits. Built once at startup and read-only afterwards.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::core::error::JudgeError;
use crate::core::limits::ResourceLimits;

const BUNDLED_LANGUAGES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Placeholder replaced by the profile's source file name in commands
const SOURCE_PLACEHOLDER: &str = "{source}";

/// Configuration for a supported programming language
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageProfile {
    /// Canonical identifier (table name in the config file)
    pub id: String,
    /// Sandbox image reference
    pub image: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Compile command (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command
    pub run_command: Vec<String>,
    /// Default run-phase limits
    pub limits: ResourceLimits,
    pub aliases: Vec<String>,
}

impl LanguageProfile {
    pub fn needs_compile(&self) -> bool {
        self.compile_command.is_some()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    image: String,
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    time_limit_ms: u64,
    memory_limit_mb: u64,
    #[serde(default = "default_output_limit_kb")]
    output_limit_kb: usize,
    #[serde(default = "default_processes")]
    processes: u32,
    #[serde(default)]
    aliases: Vec<String>,
}

fn default_output_limit_kb() -> usize {
    1024
}

fn default_processes() -> u32 {
    64
}

/// Immutable set of language profiles, looked up by id or alias
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
}

impl LanguageRegistry {
    /// Load the profiles shipped with the crate
    pub fn bundled() -> anyhow::Result<Self> {
        Self::from_toml_str(BUNDLED_LANGUAGES).context("Invalid bundled languages.toml")
    }

    /// Load profiles from a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language config {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;
        let mut profiles = HashMap::new();

        for (name, raw) in raw_configs {
            let run_command = into_command(&raw.run_command, &raw.source_file);
            if run_command.is_empty() {
                anyhow::bail!("Empty run command for {}", name);
            }
            let compile_command = match raw.compile_command {
                Some(cmd) => {
                    let cmd = into_command(&cmd, &raw.source_file);
                    if cmd.is_empty() {
                        anyhow::bail!("Empty compile command for {}", name);
                    }
                    Some(cmd)
                }
                None => None,
            };

            let profile = Arc::new(LanguageProfile {
                id: name.to_lowercase(),
                image: raw.image,
                source_file: raw.source_file,
                compile_command,
                run_command,
                limits: ResourceLimits::new(
                    raw.time_limit_ms,
                    raw.memory_limit_mb,
                    raw.output_limit_kb * 1024,
                )
                .with_processes(raw.processes),
                aliases: raw.aliases.iter().map(|a| a.to_lowercase()).collect(),
            });

            // Add main language name, then aliases
            let keys = std::iter::once(profile.id.clone()).chain(profile.aliases.clone());
            for key in keys {
                if profiles.insert(key.clone(), Arc::clone(&profile)).is_some() {
                    anyhow::bail!("Language identifier {} is defined twice", key);
                }
            }
        }

        Ok(Self { profiles })
    }

    /// Resolve a language identifier (case-insensitive, aliases allowed)
    pub fn resolve(&self, language: &str) -> Result<&LanguageProfile, JudgeError> {
        self.profiles
            .get(&language.to_lowercase())
            .map(Arc::as_ref)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    /// Canonical profiles, sorted by id
    pub fn profiles(&self) -> Vec<&LanguageProfile> {
        let mut profiles: Vec<&LanguageProfile> = self
            .profiles
            .iter()
            .filter(|(key, profile)| *key == &profile.id)
            .map(|(_, profile)| profile.as_ref())
            .collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    pub fn len(&self) -> usize {
        self.profiles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn into_command(command: &str, source_file: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(|s| s.replace(SOURCE_PLACEHOLDER, source_file))
        .collect()
}
