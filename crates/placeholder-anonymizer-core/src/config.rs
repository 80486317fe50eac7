//! Configuration management for placeholder-anonymizer

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::placeholder::normalize_entity_type;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub detection: DetectionConfig,
    pub mapping: MappingConfig,
    pub llm: Option<LlmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub mode: DetectionMode,
    pub enabled: bool,
    pub patterns: HashMap<String, String>,
    pub confidence_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Regex,
    Llm,
    #[serde(rename = "regex_llm")]
    RegexLlm,
}

impl DetectionMode {
    pub fn uses_regex(&self) -> bool {
        matches!(self, DetectionMode::Regex | DetectionMode::RegexLlm)
    }

    pub fn uses_llm(&self) -> bool {
        matches!(self, DetectionMode::Llm | DetectionMode::RegexLlm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingBackendKind {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(default)]
    pub backend: MappingBackendKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub model: String,
    pub endpoint: String,
    pub timeout_seconds: u64,
    pub prompt_template: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut patterns = HashMap::new();
        patterns.insert(
            "EMAIL".to_string(),
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b".to_string(),
        );
        patterns.insert(
            "PHONE_NUMBER".to_string(),
            r"(?:\(\d{3}\)\s?|\b\d{3}[-.\s])\d{3}[-.]\d{4}\b".to_string(),
        );
        patterns.insert("US_SSN".to_string(), r"\b\d{3}-\d{2}-\d{4}\b".to_string());
        patterns.insert(
            "IP_ADDRESS".to_string(),
            r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b".to_string(),
        );
        patterns.insert("CREDIT_CARD".to_string(), r"\b(?:\d{4}[- ]?){3}\d{4}\b".to_string());
        patterns.insert(
            "URL".to_string(),
            r#"\bhttps?://[^\s<>"']*[^\s<>"'.,;:!?)]"#.to_string(),
        );

        Self {
            detection: DetectionConfig {
                mode: DetectionMode::RegexLlm,
                enabled: true,
                patterns,
                confidence_threshold: 0.8,
            },
            mapping: MappingConfig {
                backend: MappingBackendKind::Json,
                path: PathBuf::from("entity_mapping.json"),
            },
            llm: Some(LlmConfig {
                enabled: true,
                model: "llama3.2:3b".to_string(),
                endpoint: "http://localhost:11434".to_string(),
                timeout_seconds: 300,
                prompt_template: None,
            }),
        }
    }
}

impl Config {
    pub fn get_app_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "placeholder-anonymizer", "placeholder-anonymizer")
            .ok_or_else(|| anyhow::anyhow!("Failed to determine application directories"))
    }

    /// Relative mapping paths live in the user cache directory.
    pub fn resolve_paths(&mut self) -> Result<()> {
        if self.mapping.path.is_relative() && self.mapping.path.as_os_str() != ":memory:" {
            let project_dirs = Self::get_app_dirs()?;
            let cache_dir = project_dirs.cache_dir();
            std::fs::create_dir_all(cache_dir)?;
            self.mapping.path = cache_dir.join(&self.mapping.path);
        }

        Ok(())
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.resolve_paths()?;
        Ok(config)
    }

    pub fn get_default_config_path() -> Result<PathBuf> {
        let project_dirs = Self::get_app_dirs()?;
        let config_dir = project_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.join("placeholder-anonymizer.toml"))
    }

    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, pattern) in &self.detection.patterns {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("Invalid regex pattern for '{}': {}", name, e))?;

            if normalize_entity_type(name) != *name {
                return Err(anyhow::anyhow!(
                    "Pattern name '{}' is not a valid entity type (expected something like '{}')",
                    name,
                    normalize_entity_type(name)
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow::anyhow!("Confidence threshold must be between 0.0 and 1.0"));
        }

        if let Some(parent) = self.mapping.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }
}

/// One entity span reported by a detector. Offsets are byte offsets into the
/// analysed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedEntity {
    pub entity_type: String,
    pub original_value: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

/// An entity as it was replaced in the anonymized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymizedEntity {
    pub entity_type: String,
    pub original_value: String,
    pub placeholder: String,
    pub newly_allocated: bool,
}
