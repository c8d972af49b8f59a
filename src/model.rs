//! # Data Model
//!
//! Observed entities and the entity-version rows that make up the history table.

use crate::temporal::{format_date, RunDate, Validity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Raw field value as delivered by the snapshot ingestor.
pub type FieldValue = Value;

/// Field name to value mapping, kept sorted so encodings are stable.
pub type Fields = BTreeMap<String, FieldValue>;

/// Stable identifier for "the same entity" across runs (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(pub String);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl IdentityKey {
    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

/// Digest over the tracked content fields of an entity (hex SHA-256).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(pub String);

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single catalog entry as observed in one scrape run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity {
    pub fields: Fields,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// A field counts as present when it exists and is not JSON null.
    pub fn has(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|value| !value.is_null())
    }
}

impl From<Fields> for Entity {
    fn from(fields: Fields) -> Self {
        Self { fields }
    }
}

/// One row of the history table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub identity_key: IdentityKey,
    /// Empty when imported from a table that never stored checksums
    #[serde(default)]
    pub checksum: Checksum,
    /// The content fields tracked for display and change detection
    pub fields: Fields,
    pub valid_from: RunDate,
    /// `None` while the version is currently visible
    pub valid_to: Option<RunDate>,
    /// Every closing date ever recorded for this identity, ascending
    #[serde(default)]
    pub previous_closures: Vec<RunDate>,
    /// Run dates on which a new content version replaced the previous one, ascending
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_changes: Vec<RunDate>,
    /// Present in history but missing from the latest snapshot; recomputed every run
    #[serde(default)]
    pub deleted: bool,
}

impl EntityVersion {
    /// A freshly opened version with no prior history
    pub fn open(
        identity_key: IdentityKey,
        checksum: Checksum,
        fields: Fields,
        valid_from: RunDate,
    ) -> Self {
        Self {
            identity_key,
            checksum,
            fields,
            valid_from,
            valid_to: None,
            previous_closures: Vec::new(),
            content_changes: Vec::new(),
            deleted: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Maximum of `previous_closures`
    pub fn last_closed_at(&self) -> Option<RunDate> {
        self.previous_closures.iter().max().copied()
    }

    pub fn validity(&self) -> Validity {
        Validity {
            from: self.valid_from,
            to: self.valid_to,
        }
    }

    /// Close the version at `date`, recording the closure.
    pub fn close(&mut self, date: RunDate) {
        self.valid_to = Some(date);
        insert_date(&mut self.previous_closures, date);
    }

    /// Number of times this identity has been retired
    pub fn closure_count(&self) -> usize {
        self.previous_closures.len()
    }
}

/// Insert a date, keeping the list ascending.
pub fn insert_date(dates: &mut Vec<RunDate>, date: RunDate) {
    let at = dates.partition_point(|existing| *existing <= date);
    dates.insert(at, date);
}

impl fmt::Display for EntityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.identity_key.short(), self.validity())?;
        if !self.previous_closures.is_empty() {
            let closures: Vec<String> = self
                .previous_closures
                .iter()
                .map(|date| format_date(*date))
                .collect();
            write!(f, " closures=[{}]", closures.join(","))?;
        }
        if !self.content_changes.is_empty() {
            write!(f, " edits={}", self.content_changes.len())?;
        }
        if self.deleted {
            f.write_str(" deleted")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn version() -> EntityVersion {
        EntityVersion::open(
            IdentityKey("a".repeat(64)),
            Checksum("c".repeat(64)),
            Fields::new(),
            date!(2024 - 01 - 01),
        )
    }

    #[test]
    fn test_close_appends_closure() {
        let mut row = version();
        assert!(row.is_open());
        assert_eq!(row.last_closed_at(), None);

        row.close(date!(2024 - 02 - 01));
        assert!(!row.is_open());
        assert_eq!(row.previous_closures, vec![date!(2024 - 02 - 01)]);
        assert_eq!(row.last_closed_at(), Some(date!(2024 - 02 - 01)));
    }

    #[test]
    fn test_insert_date_keeps_order() {
        let mut closures = vec![date!(2024 - 01 - 01), date!(2024 - 03 - 01)];
        insert_date(&mut closures, date!(2024 - 02 - 01));
        insert_date(&mut closures, date!(2024 - 03 - 01));
        assert_eq!(
            closures,
            vec![
                date!(2024 - 01 - 01),
                date!(2024 - 02 - 01),
                date!(2024 - 03 - 01),
                date!(2024 - 03 - 01)
            ]
        );
    }

    #[test]
    fn test_entity_presence_ignores_null() {
        let entity = Entity::new()
            .with("title", "Programm A")
            .with("url", Value::Null);
        assert!(entity.has("title"));
        assert!(!entity.has("url"));
        assert!(!entity.has("missing"));
    }

    #[test]
    fn test_version_serde_uses_iso_dates() {
        let mut row = version();
        row.close(date!(2024 - 03 - 01));
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("\"valid_from\":\"2024-01-01\""));
        assert!(json.contains("\"previous_closures\":[\"2024-03-01\"]"));
        let back: EntityVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_short_key_respects_char_boundaries() {
        assert_eq!(IdentityKey("a".repeat(64)).short(), "aaaaaaaaaaaa");
        assert_eq!(IdentityKey("abc".to_string()).short(), "abc");
        let key = IdentityKey(format!("a{}", "é".repeat(20)));
        assert_eq!(key.short(), format!("a{}", "é".repeat(11)));
    }

    #[test]
    fn test_version_without_content_changes_omits_column() {
        let row = version();
        let json = serde_json::to_string(&row).unwrap();
        assert!(!json.contains("content_changes"));
        let back: EntityVersion = serde_json::from_str(&json).unwrap();
        assert!(back.content_changes.is_empty());
    }

    #[test]
    fn test_display_mentions_deletion() {
        let mut row = version();
        row.close(date!(2024 - 03 - 01));
        row.deleted = true;
        let text = row.to_string();
        assert!(text.starts_with("aaaaaaaaaaaa [2024-01-01, 2024-03-01)"));
        assert!(text.ends_with("deleted"));
    }
}
