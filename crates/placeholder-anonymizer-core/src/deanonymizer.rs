//! Restores original values for placeholder tokens

use crate::error::Result;
use crate::mapping::{MappingBackend, MappingTable};
use crate::placeholder::token_pattern;
use regex::Captures;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeanonymizationResult {
    pub deanonymized_text: String,
    /// Number of token occurrences replaced.
    pub restored: usize,
    /// Well-formed tokens with no entry in the store, in order of appearance.
    pub unresolved: Vec<String>,
}

/// Loads `store` under a shared lock and restores every known token in
/// `text`. The store is never written.
pub fn deanonymize(text: &str, store: &dyn MappingBackend) -> Result<DeanonymizationResult> {
    let table = store.load()?;
    let result = restore(text, &table);

    info!(
        "Restored {} placeholders from {} ({} unresolved)",
        result.restored,
        store.describe(),
        result.unresolved.len()
    );
    Ok(result)
}

/// Single pass over `text`: restored values are never rescanned, so a value
/// that itself looks like a token is emitted verbatim.
pub fn restore(text: &str, table: &MappingTable) -> DeanonymizationResult {
    let mut restored = 0;
    let mut unresolved = Vec::new();

    let deanonymized_text = token_pattern()
        .replace_all(text, |caps: &Captures| {
            let token = &caps[0];
            match table.find_by_token(token) {
                Some(entry) => {
                    restored += 1;
                    entry.original_value.to_string()
                }
                None => {
                    warn!("Placeholder {} has no mapping, leaving it as is", token);
                    unresolved.push(token.to_string());
                    token.to_string()
                }
            }
        })
        .into_owned();

    debug!("Restored {} token occurrences", restored);
    DeanonymizationResult {
        deanonymized_text,
        restored,
        unresolved,
    }
}
