//! Judge configuration
//!
//! Loaded once at startup from the environment (after `.env`), then passed
//! down explicitly. Nothing here is global.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::core::limits::{LimitPolicy, ResourceLimits};
use crate::sandbox::DockerConfig;

/// Which isolation runtime runs the sandboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Docker,
    Isolate,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "isolate" => Ok(BackendKind::Isolate),
            other => anyhow::bail!("Unknown backend {:?} (expected docker or isolate)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Language profile file (None: the bundled profiles)
    pub languages_path: Option<PathBuf>,
    pub backend: BackendKind,
    pub docker_bin: String,
    /// Worker ID for isolate box ID allocation (0-9)
    pub worker_id: u32,
    /// Maximum concurrent runs in batch mode
    pub concurrency: usize,
    pub compile_time_limit_ms: u64,
    pub compile_memory_limit_mb: u64,
    pub compile_output_limit_kb: usize,
    pub max_time_limit_ms: u64,
    pub max_memory_limit_mb: u64,
    pub max_output_limit_kb: usize,
    pub max_processes: u32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            languages_path: None,
            backend: BackendKind::Docker,
            docker_bin: "docker".to_string(),
            worker_id: 0,
            concurrency: 4,
            compile_time_limit_ms: 8_000,
            compile_memory_limit_mb: 512,
            compile_output_limit_kb: 64,
            max_time_limit_ms: 10_000,
            max_memory_limit_mb: 1024,
            max_output_limit_kb: 8192,
            max_processes: 64,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value {:?} for {}", value, name)),
        None => Ok(default),
    }
}

impl JudgeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            languages_path: lookup("LANGUAGES_CONFIG").map(PathBuf::from),
            backend: parse_var(&lookup, "JUDGE_BACKEND", defaults.backend)?,
            docker_bin: lookup("DOCKER_BIN").unwrap_or(defaults.docker_bin),
            worker_id: parse_var(&lookup, "JUDGE_WORKER_ID", defaults.worker_id)?,
            concurrency: parse_var(&lookup, "JUDGE_CONCURRENCY", defaults.concurrency)?,
            compile_time_limit_ms: parse_var(
                &lookup,
                "COMPILE_TIME_LIMIT_MS",
                defaults.compile_time_limit_ms,
            )?,
            compile_memory_limit_mb: parse_var(
                &lookup,
                "COMPILE_MEMORY_LIMIT_MB",
                defaults.compile_memory_limit_mb,
            )?,
            compile_output_limit_kb: parse_var(
                &lookup,
                "COMPILE_OUTPUT_LIMIT_KB",
                defaults.compile_output_limit_kb,
            )?,
            max_time_limit_ms: parse_var(&lookup, "MAX_TIME_LIMIT_MS", defaults.max_time_limit_ms)?,
            max_memory_limit_mb: parse_var(
                &lookup,
                "MAX_MEMORY_LIMIT_MB",
                defaults.max_memory_limit_mb,
            )?,
            max_output_limit_kb: parse_var(
                &lookup,
                "MAX_OUTPUT_LIMIT_KB",
                defaults.max_output_limit_kb,
            )?,
            max_processes: parse_var(&lookup, "MAX_PROCESSES", defaults.max_processes)?,
        };

        if config.concurrency == 0 {
            anyhow::bail!("JUDGE_CONCURRENCY must be at least 1");
        }
        // Compilation is bounded at least as tightly as any run
        if config.compile_time_limit_ms > config.max_time_limit_ms {
            anyhow::bail!(
                "COMPILE_TIME_LIMIT_MS ({}) exceeds MAX_TIME_LIMIT_MS ({})",
                config.compile_time_limit_ms,
                config.max_time_limit_ms
            );
        }
        if config.compile_memory_limit_mb > config.max_memory_limit_mb {
            anyhow::bail!(
                "COMPILE_MEMORY_LIMIT_MB ({}) exceeds MAX_MEMORY_LIMIT_MB ({})",
                config.compile_memory_limit_mb,
                config.max_memory_limit_mb
            );
        }
        Ok(config)
    }

    pub fn limit_policy(&self) -> LimitPolicy {
        LimitPolicy {
            // The toolchain may fork (cc1, ld, javac threads)
            compile: ResourceLimits::new(
                self.compile_time_limit_ms,
                self.compile_memory_limit_mb,
                self.compile_output_limit_kb * 1024,
            )
            .with_processes(self.max_processes.max(128)),
            ceiling: ResourceLimits::new(
                self.max_time_limit_ms,
                self.max_memory_limit_mb,
                self.max_output_limit_kb * 1024,
            )
            .with_processes(self.max_processes),
        }
    }

    pub fn docker_config(&self) -> DockerConfig {
        let policy = self.limit_policy();
        DockerConfig {
            docker_bin: self.docker_bin.clone(),
            memory_ceiling_mb: policy.compile.memory_mb.max(policy.ceiling.memory_mb),
            max_processes: policy.compile.processes.max(policy.ceiling.processes),
            ..DockerConfig::default()
        }
    }
}
