//! Placeholder token syntax and allocation
//!
//! A placeholder is written `<<TYPE_N>>` where `TYPE` is an upper-case entity
//! type and `N` a decimal counter without leading zeros. Counters are scoped per
//! entity type and start at 1.

use crate::error::Result;
use crate::mapping::MappingTable;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

const OPEN: &str = "<<";
const CLOSE: &str = ">>";

/// Fallback type for labels that normalise to nothing usable.
pub const GENERIC_ENTITY_TYPE: &str = "ENTITY";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaceholderToken {
    entity_type: String,
    index: u64,
}

impl PlaceholderToken {
    /// `entity_type` must already be normalised, see [`normalize_entity_type`].
    pub fn new(entity_type: impl Into<String>, index: u64) -> Self {
        Self {
            entity_type: entity_type.into(),
            index,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Parses a complete token. Only the canonical spelling is accepted, so
    /// `parse(s).to_string() == s` whenever this returns `Some`.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = token_pattern().captures(text)?;
        let whole = caps.get(0)?;
        if whole.start() != 0 || whole.end() != text.len() {
            return None;
        }
        let index = caps[2].parse::<u64>().ok()?;
        Some(Self::new(&caps[1], index))
    }
}

impl fmt::Display for PlaceholderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}_{}{}", OPEN, self.entity_type, self.index, CLOSE)
    }
}

/// Matches every syntactically valid placeholder in a text.
pub fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<<([A-Z][A-Z0-9_]*)_(0|[1-9][0-9]*)>>").expect("placeholder pattern is valid")
    })
}

/// Maps a detector label such as `person_name` or `Email Address` onto the
/// token alphabet: upper-case ASCII, digits and single underscores, starting
/// with a letter.
pub fn normalize_entity_type(label: &str) -> String {
    let mut normalized = String::with_capacity(label.len());
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            normalized.push(ch.to_ascii_uppercase());
        } else if !normalized.is_empty() && !normalized.ends_with('_') {
            normalized.push('_');
        }
    }
    while normalized.ends_with('_') {
        normalized.pop();
    }

    match normalized.chars().next() {
        None => GENERIC_ENTITY_TYPE.to_string(),
        Some(first) if first.is_ascii_digit() => format!("{}_{}", GENERIC_ENTITY_TYPE, normalized),
        Some(_) => normalized,
    }
}

/// Outcome of [`allocate_or_reuse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub token: String,
    pub newly_allocated: bool,
}

/// Returns the placeholder already mapped to `(entity_type, value)`, or stages
/// a new entry under the next free counter for that type. Nothing is persisted
/// here; the caller saves the table once per call.
pub fn allocate_or_reuse(table: &mut MappingTable, entity_type: &str, value: &str) -> Result<Allocation> {
    if let Some(existing) = table.find_by_value(entity_type, value) {
        return Ok(Allocation {
            token: existing.token.to_string(),
            newly_allocated: false,
        });
    }

    let token = table.next_token(entity_type)?;
    let rendered = token.to_string();
    table.insert(&token, value);
    debug!("Allocated placeholder {} for new {} entity", rendered, entity_type);

    Ok(Allocation {
        token: rendered,
        newly_allocated: true,
    })
}
