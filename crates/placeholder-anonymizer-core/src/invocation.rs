//! Request/response contract between a caller and the engine
//!
//! The binary is one transport for this contract (stdin in, JSON on stdout,
//! exit code); in-process callers use [`Engine::invoke`] directly.

use crate::anonymizer::anonymize;
use crate::config::Config;
use crate::deanonymizer::deanonymize;
use crate::detection::{DetectionPipeline, Detector};
use crate::error::{Error, Result};
use crate::mapping::{open_backend, MappingBackend, MappingStatistics};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Replace detected entities with placeholders
    Anonymize,
    /// Restore original values for known placeholders
    Deanonymize,
    /// Report mapping store statistics
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub mode: Mode,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InvocationResponse {
    Anonymized { anonymized_text: String },
    Deanonymized { deanonymized_text: String },
    Statistics(MappingStatistics),
}

impl InvocationResponse {
    /// Pretty-printed document terminated by a newline.
    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Invocation(format!("failed to serialise response: {}", e)))?;
        json.push('\n');
        Ok(json)
    }
}

pub struct Engine<D> {
    detector: D,
    store: Box<dyn MappingBackend>,
}

impl Engine<DetectionPipeline> {
    /// Builds the configured detection pipeline and opens the configured store.
    pub fn from_config(config: &Config) -> Result<Self> {
        let detector =
            DetectionPipeline::from_config(config).map_err(|e| Error::Config(format!("{:#}", e)))?;
        let store = open_backend(&config.mapping)?;
        Ok(Self::new(detector, store))
    }
}

impl<D: Detector> Engine<D> {
    pub fn new(detector: D, store: Box<dyn MappingBackend>) -> Self {
        Self { detector, store }
    }

    pub fn store(&self) -> &dyn MappingBackend {
        self.store.as_ref()
    }

    pub async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationResponse> {
        debug!("Handling {:?} request ({} bytes)", request.mode, request.text.len());

        match request.mode {
            Mode::Anonymize => {
                let result = anonymize(&request.text, &self.detector, self.store.as_ref()).await?;
                Ok(InvocationResponse::Anonymized {
                    anonymized_text: result.anonymized_text,
                })
            }
            Mode::Deanonymize => {
                let result = deanonymize(&request.text, self.store.as_ref())?;
                Ok(InvocationResponse::Deanonymized {
                    deanonymized_text: result.deanonymized_text,
                })
            }
            Mode::Stats => Ok(InvocationResponse::Statistics(self.store.statistics()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectedEntity, DetectionMode, MappingBackendKind};
    use crate::mapping::MemoryStore;
    use tempfile::TempDir;

    struct NameDetector;

    impl Detector for NameDetector {
        async fn detect(&self, text: &str) -> anyhow::Result<Vec<DetectedEntity>> {
            Ok(text
                .match_indices("Peter")
                .map(|(start, value)| DetectedEntity {
                    entity_type: "PERSON".to_string(),
                    original_value: value.to_string(),
                    start,
                    end: start + value.len(),
                    confidence: 1.0,
                })
                .collect())
        }
    }

    fn request(mode: Mode, text: &str) -> InvocationRequest {
        InvocationRequest {
            mode,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_invoke_each_mode() {
        let engine = Engine::new(NameDetector, Box::new(MemoryStore::new()));

        let anonymized = engine.invoke(&request(Mode::Anonymize, "Peter is here")).await.unwrap();
        assert_eq!(
            anonymized,
            InvocationResponse::Anonymized {
                anonymized_text: "<<PERSON_1>> is here".to_string()
            }
        );

        let restored = engine.invoke(&request(Mode::Deanonymize, "<<PERSON_1>> is here")).await.unwrap();
        assert_eq!(
            restored,
            InvocationResponse::Deanonymized {
                deanonymized_text: "Peter is here".to_string()
            }
        );

        match engine.invoke(&request(Mode::Stats, "")).await.unwrap() {
            InvocationResponse::Statistics(stats) => {
                assert_eq!(stats.total_mappings, 1);
                assert_eq!(stats.mappings_by_type.get("PERSON"), Some(&1));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_response_json_shape() {
        let response = InvocationResponse::Anonymized {
            anonymized_text: "Hi <<PERSON_1>>".to_string(),
        };
        assert_eq!(
            response.to_json().unwrap(),
            "{\n  \"anonymized_text\": \"Hi <<PERSON_1>>\"\n}\n"
        );

        let response = InvocationResponse::Deanonymized {
            deanonymized_text: "Hi Peter".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&response.to_json().unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({ "deanonymized_text": "Hi Peter" }));
    }

    #[test]
    fn test_statistics_json_shape() {
        let mut stats = MappingStatistics::default();
        stats.total_mappings = 2;
        stats.mappings_by_type.insert("EMAIL".to_string(), 2);

        let value: serde_json::Value =
            serde_json::from_str(&InvocationResponse::Statistics(stats).to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "total_mappings": 2, "mappings_by_type": { "EMAIL": 2 } })
        );
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(Mode::from_str("anonymize", false).unwrap(), Mode::Anonymize);
        assert_eq!(Mode::from_str("deanonymize", false).unwrap(), Mode::Deanonymize);
        assert!(Mode::from_str("encrypt", false).is_err());

        let parsed: Mode = serde_json::from_str("\"stats\"").unwrap();
        assert_eq!(parsed, Mode::Stats);
    }

    #[tokio::test]
    async fn test_engine_from_regex_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.detection.mode = DetectionMode::Regex;
        config.mapping.backend = MappingBackendKind::Json;
        config.mapping.path = temp_dir.path().join("map.json");

        let engine = Engine::from_config(&config).unwrap();
        let response = engine
            .invoke(&request(Mode::Anonymize, "Write to ops@example.com"))
            .await
            .unwrap();

        assert_eq!(
            response,
            InvocationResponse::Anonymized {
                anonymized_text: "Write to <<EMAIL_1>>".to_string()
            }
        );
        assert!(config.mapping.path.exists());
    }
}
