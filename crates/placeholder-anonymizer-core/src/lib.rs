pub mod anonymizer;
pub mod config;
pub mod deanonymizer;
pub mod detection;
pub mod error;
pub mod file_store;
pub mod invocation;
pub mod mapping;
pub mod ollama;
pub mod placeholder;
pub mod prompt_loader;
pub mod sqlite;


pub use anonymizer::{anonymize, AnonymizationResult};
pub use config::{Config, DetectionConfig, DetectionMode, MappingBackendKind, MappingConfig, LlmConfig, DetectedEntity, AnonymizedEntity};
pub use deanonymizer::{deanonymize, restore, DeanonymizationResult};
pub use detection::{resolve_overlaps, DetectionPipeline, Detector, RegexDetectionEngine};
pub use error::{Error, Result};
pub use file_store::JsonFileStore;
pub use invocation::{Engine, InvocationRequest, InvocationResponse, Mode};
pub use mapping::{open_backend, MappingBackend, MappingEntry, MappingStatistics, MappingTable, MemoryStore};
pub use ollama::{OllamaClient, OllamaConfig, LlmResponse, LlmDetectedEntity};
pub use placeholder::{allocate_or_reuse, normalize_entity_type, PlaceholderToken};
pub use prompt_loader::PromptLoader;
pub use sqlite::SqliteMappingStore;
