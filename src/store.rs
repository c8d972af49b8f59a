//! # Store Module
//!
//! The history store seam and an in-memory implementation, plus read-side helpers over
//! a loaded history table.

use crate::model::{EntityVersion, IdentityKey};
use crate::temporal::RunDate;
use anyhow::Result;
use hashbrown::HashMap;
use std::path::Path;

/// Storage for the accumulated history table.
///
/// The engine never talks to a store directly; callers load the table, reconcile,
/// and hand the complete next generation back via [`HistoryStore::replace`].
pub trait HistoryStore: Send {
    /// Load every row of the current generation.
    fn load(&self) -> Result<Vec<EntityVersion>>;

    /// Replace the table wholesale with `rows`, recording the run that produced them.
    fn replace(&mut self, rows: &[EntityVersion], run_date: RunDate) -> Result<()>;

    /// Date of the last run written with [`HistoryStore::replace`].
    fn last_run(&self) -> Result<Option<RunDate>>;

    /// Number of rows in the current generation.
    fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Create a durable checkpoint, if supported.
    fn checkpoint(&self, _path: &Path) -> Result<()> {
        anyhow::bail!("checkpoint is not supported by this store")
    }
}

/// History held in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryHistoryStore {
    rows: Vec<EntityVersion>,
    last_run: Option<RunDate>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing table
    pub fn with_rows(rows: Vec<EntityVersion>) -> Self {
        Self {
            rows,
            last_run: None,
        }
    }

    pub fn rows(&self) -> &[EntityVersion] {
        &self.rows
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self) -> Result<Vec<EntityVersion>> {
        Ok(self.rows.clone())
    }

    fn replace(&mut self, rows: &[EntityVersion], run_date: RunDate) -> Result<()> {
        self.rows = rows.to_vec();
        self.last_run = Some(run_date);
        Ok(())
    }

    fn last_run(&self) -> Result<Option<RunDate>> {
        Ok(self.last_run)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.rows.len())
    }
}

/// Read-only view over a loaded history generation.
#[derive(Debug, Clone, Default)]
pub struct HistoryTable {
    rows: Vec<EntityVersion>,
    by_key: HashMap<IdentityKey, usize>,
}

/// Counts summarizing a history generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistorySummary {
    pub identities: usize,
    pub open: usize,
    pub deleted: usize,
    /// Identities retired at least once, whatever their current state
    pub ever_retired: usize,
    /// Identities currently open that had been retired before
    pub returned: usize,
    /// Identities whose content was replaced at least once
    pub edited: usize,
}

impl HistoryTable {
    pub fn new(rows: Vec<EntityVersion>) -> Self {
        let by_key = rows
            .iter()
            .enumerate()
            .map(|(index, row)| (row.identity_key.clone(), index))
            .collect();
        Self { rows, by_key }
    }

    pub fn rows(&self) -> &[EntityVersion] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<EntityVersion> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row for an identity; when a key appears more than once the last row wins.
    pub fn get(&self, key: &IdentityKey) -> Option<&EntityVersion> {
        self.by_key.get(key).map(|index| &self.rows[*index])
    }

    /// Currently visible versions
    pub fn open_rows(&self) -> impl Iterator<Item = &EntityVersion> {
        self.rows.iter().filter(|row| row.is_open())
    }

    /// Versions missing from the latest snapshot
    pub fn deleted_rows(&self) -> impl Iterator<Item = &EntityVersion> {
        self.rows.iter().filter(|row| row.deleted)
    }

    /// Versions whose current interval was visible on `date`
    pub fn visible_on(&self, date: RunDate) -> impl Iterator<Item = &EntityVersion> {
        self.rows
            .iter()
            .filter(move |row| row.validity().contains(date))
    }

    /// Versions closed on exactly `date`
    pub fn closed_on(&self, date: RunDate) -> impl Iterator<Item = &EntityVersion> {
        self.rows
            .iter()
            .filter(move |row| row.previous_closures.contains(&date))
    }

    pub fn summary(&self) -> HistorySummary {
        let mut summary = HistorySummary {
            identities: self.by_key.len(),
            ..HistorySummary::default()
        };
        for row in &self.rows {
            if row.is_open() {
                summary.open += 1;
                if !row.previous_closures.is_empty() {
                    summary.returned += 1;
                }
            }
            if row.deleted {
                summary.deleted += 1;
            }
            if !row.previous_closures.is_empty() {
                summary.ever_retired += 1;
            }
            if !row.content_changes.is_empty() {
                summary.edited += 1;
            }
        }
        summary
    }
}

impl From<Vec<EntityVersion>> for HistoryTable {
    fn from(rows: Vec<EntityVersion>) -> Self {
        Self::new(rows)
    }
}
