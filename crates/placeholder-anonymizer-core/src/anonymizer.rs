//! Replaces detected entities with placeholder tokens
//!
//! Detection runs before the store is locked; the exclusive lock only covers
//! allocation and the single save, so a slow LLM never blocks other callers.
//! Nothing is persisted unless the whole text was substituted.

use crate::config::{AnonymizedEntity, DetectedEntity};
use crate::detection::Detector;
use crate::error::{Error, Result};
use crate::mapping::MappingBackend;
use crate::placeholder::{allocate_or_reuse, normalize_entity_type, token_pattern};
use std::ops::Range;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymizationResult {
    pub anonymized_text: String,
    /// One element per substituted span, in text order.
    pub entities: Vec<AnonymizedEntity>,
}

impl AnonymizationResult {
    fn unchanged(text: &str) -> Self {
        Self {
            anonymized_text: text.to_string(),
            entities: Vec::new(),
        }
    }

    pub fn newly_allocated(&self) -> usize {
        self.entities.iter().filter(|e| e.newly_allocated).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    range: Range<usize>,
    entity_type: String,
}

pub async fn anonymize<D: Detector>(
    text: &str,
    detector: &D,
    store: &dyn MappingBackend,
) -> Result<AnonymizationResult> {
    if text.is_empty() {
        debug!("Empty input, nothing to anonymize");
        return Ok(AnonymizationResult::unchanged(text));
    }

    let detected = detector.detect(text).await.map_err(Error::Detection)?;
    let spans = prepare_spans(text, detected)?;

    if spans.is_empty() {
        // Still surface an unreadable store even though nothing is written.
        store.load()?;
        debug!("No entities detected, text passes through unchanged");
        return Ok(AnonymizationResult::unchanged(text));
    }

    let mut result = AnonymizationResult::unchanged("");
    store.update(&mut |table| {
        let mut output = String::with_capacity(text.len());
        let mut entities = Vec::with_capacity(spans.len());
        let mut cursor = 0;

        for span in &spans {
            let value = &text[span.range.clone()];
            let allocation = allocate_or_reuse(table, &span.entity_type, value)?;

            output.push_str(&text[cursor..span.range.start]);
            output.push_str(&allocation.token);
            cursor = span.range.end;

            entities.push(AnonymizedEntity {
                entity_type: span.entity_type.clone(),
                original_value: value.to_string(),
                placeholder: allocation.token,
                newly_allocated: allocation.newly_allocated,
            });
        }
        output.push_str(&text[cursor..]);

        result = AnonymizationResult {
            anonymized_text: output,
            entities,
        };
        Ok(())
    })?;

    info!(
        "Anonymized {} entities ({} new placeholders) against {}",
        result.entities.len(),
        result.newly_allocated(),
        store.describe()
    );
    Ok(result)
}

/// Validates detector output against `text` and reduces it to ordered,
/// non-overlapping spans with normalised entity types.
fn prepare_spans(text: &str, detected: Vec<DetectedEntity>) -> Result<Vec<Span>> {
    let mut candidates = Vec::with_capacity(detected.len());

    for entity in detected {
        let in_bounds = entity.start <= entity.end && entity.end <= text.len();
        if !in_bounds || !text.is_char_boundary(entity.start) || !text.is_char_boundary(entity.end) {
            return Err(Error::Detection(anyhow::anyhow!(
                "detector reported invalid {} span {}..{} for a {}-byte text",
                entity.entity_type,
                entity.start,
                entity.end,
                text.len()
            )));
        }
        if entity.start == entity.end {
            continue;
        }

        candidates.push(Span {
            range: entity.start..entity.end,
            entity_type: normalize_entity_type(&entity.entity_type),
        });
    }

    candidates.sort_by(|a, b| {
        a.range
            .start
            .cmp(&b.range.start)
            .then_with(|| b.range.len().cmp(&a.range.len()))
    });

    let existing_tokens: Vec<Range<usize>> = token_pattern().find_iter(text).map(|m| m.range()).collect();
    let overlaps = |a: &Range<usize>, b: &Range<usize>| a.start < b.end && b.start < a.end;

    let mut spans: Vec<Span> = Vec::with_capacity(candidates.len());
    for span in candidates {
        if existing_tokens.iter().any(|token| overlaps(token, &span.range)) {
            debug!(
                "Skipping {} span {}..{} inside an existing placeholder",
                span.entity_type, span.range.start, span.range.end
            );
            continue;
        }
        if let Some(previous) = spans.last() {
            if span.range.start < previous.range.end {
                warn!(
                    "Dropping {} span {}..{} overlapping {} span {}..{}",
                    span.entity_type,
                    span.range.start,
                    span.range.end,
                    previous.entity_type,
                    previous.range.start,
                    previous.range.end
                );
                continue;
            }
        }
        spans.push(span);
    }

    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::JsonFileStore;
    use crate::mapping::{MappingTable, MemoryStore, UpdateFn};
    use crate::placeholder::PlaceholderToken;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct FixedDetector(Vec<(&'static str, &'static str)>);

    impl Detector for FixedDetector {
        async fn detect(&self, text: &str) -> anyhow::Result<Vec<DetectedEntity>> {
            let mut entities = Vec::new();
            for (entity_type, value) in &self.0 {
                for (start, matched) in text.match_indices(value) {
                    entities.push(DetectedEntity {
                        entity_type: entity_type.to_string(),
                        original_value: matched.to_string(),
                        start,
                        end: start + matched.len(),
                        confidence: 0.9,
                    });
                }
            }
            Ok(entities)
        }
    }

    struct RawDetector(Vec<DetectedEntity>);

    impl Detector for RawDetector {
        async fn detect(&self, _text: &str) -> anyhow::Result<Vec<DetectedEntity>> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        async fn detect(&self, _text: &str) -> anyhow::Result<Vec<DetectedEntity>> {
            anyhow::bail!("model unavailable")
        }
    }

    /// Swaps the store directory for a plain file once the table is staged, so
    /// the save that follows fails.
    struct VanishingDirectory {
        inner: JsonFileStore,
        dir: PathBuf,
        moved: PathBuf,
    }

    impl MappingBackend for VanishingDirectory {
        fn load(&self) -> Result<MappingTable> {
            self.inner.load()
        }

        fn update(&self, apply: &mut UpdateFn<'_>) -> Result<()> {
            self.inner.update(&mut |table| {
                apply(table)?;
                std::fs::rename(&self.dir, &self.moved).unwrap();
                std::fs::write(&self.dir, "").unwrap();
                Ok(())
            })
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    fn span(entity_type: &str, start: usize, end: usize) -> DetectedEntity {
        DetectedEntity {
            entity_type: entity_type.to_string(),
            original_value: String::new(),
            start,
            end,
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn test_contact_example() {
        let store = MemoryStore::new();
        let detector = FixedDetector(vec![("PERSON", "John Smith"), ("EMAIL", "john@example.com")]);

        let result = anonymize("Contact John Smith at john@example.com", &detector, &store)
            .await
            .unwrap();

        assert_eq!(result.anonymized_text, "Contact <<PERSON_1>> at <<EMAIL_1>>");
        assert_eq!(result.newly_allocated(), 2);

        let table = store.load().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.find_by_token("<<PERSON_1>>").unwrap().original_value, "John Smith");
        assert_eq!(table.find_by_token("<<EMAIL_1>>").unwrap().entity_type, "EMAIL");
    }

    #[tokio::test]
    async fn test_repeated_value_reuses_token() {
        let store = MemoryStore::new();
        let detector = FixedDetector(vec![("PERSON", "Peter"), ("PERSON", "Heidi")]);

        let first = anonymize("Peter met Heidi. Peter left.", &detector, &store).await.unwrap();
        assert_eq!(first.anonymized_text, "<<PERSON_1>> met <<PERSON_2>>. <<PERSON_1>> left.");
        assert_eq!(first.newly_allocated(), 2);

        let second = anonymize("Heidi stayed.", &detector, &store).await.unwrap();
        assert_eq!(second.anonymized_text, "<<PERSON_2>> stayed.");
        assert_eq!(second.newly_allocated(), 0);
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_entity_types_are_normalised() {
        let store = MemoryStore::new();
        let detector = FixedDetector(vec![("person_name", "Ann")]);

        let result = anonymize("Ann", &detector, &store).await.unwrap();
        assert_eq!(result.anonymized_text, "<<PERSON_NAME_1>>");
        assert_eq!(result.entities[0].entity_type, "PERSON_NAME");
    }

    #[tokio::test]
    async fn test_empty_input_skips_detection() {
        let store = MemoryStore::new();

        let result = anonymize("", &FailingDetector, &store).await.unwrap();
        assert_eq!(result.anonymized_text, "");
        assert!(result.entities.is_empty());
    }

    #[tokio::test]
    async fn test_no_entities_passes_through() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("map.json"));

        let result = anonymize("hello world", &FixedDetector(vec![]), &store).await.unwrap();

        assert_eq!(result.anonymized_text, "hello world");
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_detection_failure_leaves_store_alone() {
        let store = MemoryStore::new();

        let err = anonymize("Peter", &FailingDetector, &store).await.unwrap_err();
        assert!(matches!(err, Error::Detection(_)));
        assert_eq!(err.kind(), "DetectionFailure");
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_bounds_span_is_detection_failure() {
        let store = MemoryStore::new();
        let detector = RawDetector(vec![span("PERSON", 3, 40)]);

        let err = anonymize("short", &detector, &store).await.unwrap_err();
        assert!(matches!(err, Error::Detection(_)));
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_span_splitting_a_character_is_detection_failure() {
        let store = MemoryStore::new();
        // "é" occupies bytes 2..4
        let detector = RawDetector(vec![span("PERSON", 0, 3)]);

        let err = anonymize("Zoé", &detector, &store).await.unwrap_err();
        assert!(matches!(err, Error::Detection(_)));
    }

    #[tokio::test]
    async fn test_overlapping_spans_keep_the_earliest_longest() {
        let store = MemoryStore::new();
        let text = "Mail john.smith@example.com today";
        let detector = RawDetector(vec![
            span("PERSON", 5, 15),
            span("EMAIL", 5, 27),
            span("URL", 16, 27),
        ]);

        let result = anonymize(text, &detector, &store).await.unwrap();
        assert_eq!(result.anonymized_text, "Mail <<EMAIL_1>> today");
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_placeholders_are_not_nested() {
        let mut table = MappingTable::default();
        table.insert(&PlaceholderToken::new("PERSON", 1), "Ann");
        let store = MemoryStore::with_table(table);
        let text = "<<PERSON_1>> met Bob";
        let detector = RawDetector(vec![span("ENTITY", 2, 10), span("PERSON", 17, 20)]);

        let result = anonymize(text, &detector, &store).await.unwrap();
        assert_eq!(result.anonymized_text, "<<PERSON_1>> met <<PERSON_2>>");
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].original_value, "Bob");
    }

    #[tokio::test]
    async fn test_value_is_taken_from_source_text() {
        let store = MemoryStore::new();
        let mut reported = span("PERSON", 0, 5);
        reported.original_value = "peter".to_string();

        let result = anonymize("Peter", &RawDetector(vec![reported]), &store).await.unwrap();
        assert_eq!(result.entities[0].original_value, "Peter");
        assert!(store.load().unwrap().find_by_value("PERSON", "Peter").is_some());
    }

    #[tokio::test]
    async fn test_corrupt_store_fails_even_without_entities() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("map.json");
        std::fs::write(&path, "not json at all").unwrap();
        let store = JsonFileStore::new(&path);

        let err = anonymize("hello world", &FixedDetector(vec![]), &store).await.unwrap_err();
        assert!(matches!(err, Error::StoreCorrupt { .. }));

        let err = anonymize("Peter", &FixedDetector(vec![("PERSON", "Peter")]), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreCorrupt { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json at all");
    }

    #[tokio::test]
    async fn test_save_failure_returns_no_text_and_keeps_store() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("store");
        let moved = temp_dir.path().join("moved");
        let inner = JsonFileStore::new(dir.join("map.json"));
        let detector = FixedDetector(vec![("PERSON", "Peter"), ("PERSON", "Heidi")]);
        anonymize("Peter", &detector, &inner).await.unwrap();
        let before = std::fs::read_to_string(inner.path()).unwrap();

        let store = VanishingDirectory {
            inner,
            dir,
            moved: moved.clone(),
        };
        let err = anonymize("Peter met Heidi", &detector, &store).await.unwrap_err();

        assert!(matches!(err, Error::StoreWrite { .. }));
        assert_eq!(err.kind(), "StoreWriteFailure");
        assert_eq!(err.exit_code(), 6);
        assert_eq!(std::fs::read_to_string(moved.join("map.json")).unwrap(), before);
    }

    #[tokio::test]
    async fn test_exhausted_counter_fails_without_saving() {
        let mut table = MappingTable::default();
        table.insert(&PlaceholderToken::new("PERSON", u64::MAX), "Ann");
        let store = MemoryStore::with_table(table);
        let detector = FixedDetector(vec![("PERSON", "Ann"), ("PERSON", "Bob")]);

        assert_eq!(
            anonymize("Ann", &detector, &store).await.unwrap().anonymized_text,
            "<<PERSON_18446744073709551615>>"
        );

        let err = anonymize("Ann and Bob", &detector, &store).await.unwrap_err();
        assert!(matches!(err, Error::CounterExhausted { .. }));
        assert_eq!(err.exit_code(), 4);
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
