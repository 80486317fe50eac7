//! PII detection: the `Detector` capability, the regex engine and the
//! configured regex/LLM pipeline

use crate::config::{Config, DetectedEntity, DetectionConfig, DetectionMode};
use crate::ollama::{OllamaClient, OllamaConfig};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Finds entity spans in a text. Implementations keep no state between calls.
#[allow(async_fn_in_trait)]
pub trait Detector {
    async fn detect(&self, text: &str) -> Result<Vec<DetectedEntity>>;
}

#[derive(Clone)]
pub struct RegexDetectionEngine {
    patterns: HashMap<String, Regex>,
    confidence_threshold: f64,
}

impl RegexDetectionEngine {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let mut patterns = HashMap::new();

        for (name, pattern_str) in &config.patterns {
            match Regex::new(pattern_str) {
                Ok(regex) => {
                    patterns.insert(name.clone(), regex);
                    debug!("Loaded regex pattern for '{}': {}", name, pattern_str);
                }
                Err(e) => {
                    warn!("Invalid regex pattern for '{}': {}", name, e);
                    return Err(anyhow::anyhow!("Invalid regex pattern for '{}': {}", name, e));
                }
            }
        }

        Ok(Self {
            patterns,
            confidence_threshold: config.confidence_threshold,
        })
    }

    pub fn detect_in_text(&self, text: &str) -> Vec<DetectedEntity> {
        let mut entities = Vec::new();

        for (entity_type, regex) in &self.patterns {
            for mat in regex.find_iter(text) {
                let entity = DetectedEntity {
                    entity_type: entity_type.clone(),
                    original_value: mat.as_str().to_string(),
                    start: mat.start(),
                    end: mat.end(),
                    confidence: self.calculate_confidence(entity_type, mat.as_str()),
                };

                if entity.confidence >= self.confidence_threshold {
                    entities.push(entity);
                }
            }
        }

        entities.sort_by_key(|e| (e.start, e.end));
        entities
    }

    // Cheap shape checks per type; anything unknown gets the default score.
    fn calculate_confidence(&self, entity_type: &str, text: &str) -> f64 {
        match entity_type {
            "EMAIL" | "EMAIL_ADDRESS" => {
                if text.contains('@') && text.contains('.') {
                    0.95
                } else {
                    0.7
                }
            }
            "PHONE_NUMBER" => {
                let digit_count = text.chars().filter(|c| c.is_ascii_digit()).count();
                if digit_count >= 10 {
                    0.9
                } else {
                    0.6
                }
            }
            "US_SSN" => {
                if text.matches('-').count() == 2 {
                    0.95
                } else {
                    0.8
                }
            }
            "CREDIT_CARD" => {
                let digit_count = text.chars().filter(|c| c.is_ascii_digit()).count();
                if digit_count == 16 {
                    0.85
                } else {
                    0.7
                }
            }
            "IP_ADDRESS" => {
                let parts: Vec<&str> = text.split('.').collect();
                if parts.len() == 4 && parts.iter().all(|&p| p.parse::<u8>().is_ok()) {
                    0.95
                } else {
                    0.7
                }
            }
            "URL" => {
                if text.starts_with("http://") || text.starts_with("https://") {
                    0.9
                } else {
                    0.7
                }
            }
            _ => 0.8,
        }
    }
}

impl Detector for RegexDetectionEngine {
    async fn detect(&self, text: &str) -> Result<Vec<DetectedEntity>> {
        Ok(self.detect_in_text(text))
    }
}

/// Regex and/or LLM detection as selected by `detection.mode`, merged into a
/// non-overlapping list ordered by start offset.
pub struct DetectionPipeline {
    enabled: bool,
    mode: DetectionMode,
    regex: RegexDetectionEngine,
    llm: Option<OllamaClient>,
}

impl DetectionPipeline {
    pub fn new(detection: &DetectionConfig, llm: Option<OllamaClient>) -> Result<Self> {
        Ok(Self {
            enabled: detection.enabled,
            mode: detection.mode.clone(),
            regex: RegexDetectionEngine::new(detection)?,
            llm,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let llm = if config.detection.mode.uses_llm() {
            // Without an [llm] section the local Ollama defaults apply.
            let (ollama_config, template) = match config.llm.as_ref() {
                Some(llm) => (
                    OllamaConfig {
                        enabled: llm.enabled,
                        endpoint: llm.endpoint.clone(),
                        model: llm.model.clone(),
                        timeout_seconds: llm.timeout_seconds,
                    },
                    llm.prompt_template.as_ref(),
                ),
                None => (
                    OllamaConfig {
                        enabled: true,
                        ..OllamaConfig::default()
                    },
                    None,
                ),
            };
            Some(OllamaClient::new(ollama_config, template)?)
        } else {
            None
        };

        Self::new(&config.detection, llm)
    }

    async fn detect_with_llm(&self, text: &str) -> Result<Vec<DetectedEntity>> {
        let client = match (&self.llm, self.mode.uses_llm()) {
            (Some(client), true) if client.is_enabled() => client,
            _ => return Ok(Vec::new()),
        };

        let healthy = client
            .health_check()
            .await
            .with_context(|| format!("Ollama at {} is not reachable", client.endpoint()))?;
        if !healthy {
            anyhow::bail!("Ollama at {} failed its health check", client.endpoint());
        }

        client
            .extract_entities(text)
            .await
            .context("LLM entity extraction failed")
    }
}

impl Detector for DetectionPipeline {
    async fn detect(&self, text: &str) -> Result<Vec<DetectedEntity>> {
        if !self.enabled {
            debug!("Detection disabled, passing text through");
            return Ok(Vec::new());
        }

        let regex_entities = if self.mode.uses_regex() {
            self.regex.detect_in_text(text)
        } else {
            Vec::new()
        };
        let llm_entities = self.detect_with_llm(text).await?;

        info!(
            "Detected {} regex and {} LLM entities",
            regex_entities.len(),
            llm_entities.len()
        );
        Ok(resolve_overlaps(regex_entities, llm_entities))
    }
}

/// Merges two detector outputs into non-overlapping spans. The earliest start
/// wins, then the longer span, then the LLM span over a regex span covering
/// exactly the same range.
pub fn resolve_overlaps(
    regex_entities: Vec<DetectedEntity>,
    llm_entities: Vec<DetectedEntity>,
) -> Vec<DetectedEntity> {
    let mut candidates: Vec<(u8, DetectedEntity)> = llm_entities
        .into_iter()
        .map(|e| (0, e))
        .chain(regex_entities.into_iter().map(|e| (1, e)))
        .filter(|(_, e)| e.start < e.end)
        .collect();

    candidates.sort_by(|(pa, a), (pb, b)| {
        a.start
            .cmp(&b.start)
            .then_with(|| (b.end - b.start).cmp(&(a.end - a.start)))
            .then_with(|| pa.cmp(pb))
    });

    let mut resolved: Vec<DetectedEntity> = Vec::with_capacity(candidates.len());
    for (_, entity) in candidates {
        match resolved.last() {
            Some(last) if entity.start < last.end => {
                debug!(
                    "Dropping {} span {}-{} overlapping {} span {}-{}",
                    entity.entity_type, entity.start, entity.end, last.entity_type, last.start, last.end
                );
            }
            _ => resolved.push(entity),
        }
    }
    resolved
}
