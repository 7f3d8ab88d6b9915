//! Submission intake types

use std::collections::HashSet;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::core::error::JudgeError;
use crate::core::limits::LimitOverrides;
use crate::languages::LanguageProfile;

/// A file to materialize inside the sandbox working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the sandbox working directory
    pub path: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// A single judge request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    /// Language identifier (case-insensitive, aliases allowed)
    pub language: String,
    /// Single-file source, written to the profile's source file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Multi-file source tree
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<SourceFile>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default, skip_serializing_if = "LimitOverrides::is_empty")]
    pub limits: LimitOverrides,
    /// Expected output for comparison (none: exit code alone decides)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

impl Submission {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn with_files(language: impl Into<String>, files: Vec<SourceFile>) -> Self {
        Self {
            language: language.into(),
            files,
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }

    /// Build the file set to write into the sandbox for the given profile
    pub fn materialize(&self, profile: &LanguageProfile) -> Result<Vec<SourceFile>, JudgeError> {
        match (&self.source, self.files.is_empty()) {
            (Some(source), true) => Ok(vec![SourceFile::new(&profile.source_file, source)]),
            (None, false) => {
                let mut seen = HashSet::new();
                for file in &self.files {
                    if !is_safe_path(&file.path) {
                        return Err(JudgeError::InvalidSubmission(format!(
                            "unsafe file path: {:?}",
                            file.path
                        )));
                    }
                    if !seen.insert(file.path.as_str()) {
                        return Err(JudgeError::InvalidSubmission(format!(
                            "duplicate file path: {:?}",
                            file.path
                        )));
                    }
                }
                Ok(self.files.clone())
            }
            (Some(_), false) => Err(JudgeError::InvalidSubmission(
                "both `source` and `files` were given".to_string(),
            )),
            (None, true) => Err(JudgeError::InvalidSubmission(
                "submission has no source".to_string(),
            )),
        }
    }
}

/// Check if a file path is safe (relative, no path traversal)
fn is_safe_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
