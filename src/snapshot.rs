//! # Snapshot Module
//!
//! The hand-off between a snapshot ingestor and the reconciliation engine.
//!
//! A [`Snapshot`] can only be obtained from [`SnapshotBuilder::finish`], which the
//! ingestor calls once every page of the catalog has been collected. A run that was
//! cancelled or failed mid-way never produces a `Snapshot`, so it can never be
//! reconciled and mark still-live entries as deleted.

use crate::model::Entity;
use crate::temporal::{format_date, RunDate};
use crate::reconcile::ReconcileError;
use tracing::debug;

/// The complete set of entities observed in one scrape run.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    observed_at: RunDate,
    entities: Vec<Entity>,
}

impl Snapshot {
    pub fn observed_at(&self) -> RunDate {
        self.observed_at
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn into_entities(self) -> Vec<Entity> {
        self.entities
    }
}

/// Accumulates entities while an ingestor walks the catalog.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    observed_at: RunDate,
    entities: Vec<Entity>,
    expected: Option<usize>,
}

impl SnapshotBuilder {
    pub fn new(observed_at: RunDate) -> Self {
        Self {
            observed_at,
            entities: Vec::new(),
            expected: None,
        }
    }

    /// Declare how many entries the catalog reports (e.g. its published hit count).
    pub fn expect(mut self, count: usize) -> Self {
        self.expected = Some(count);
        self
    }

    pub fn push(&mut self, entity: Entity) {
        self.entities.push(entity);
    }

    pub fn extend<I: IntoIterator<Item = Entity>>(&mut self, entities: I) {
        self.entities.extend(entities);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Seal the run. Fails when fewer entities were collected than the catalog declared.
    pub fn finish(self) -> Result<Snapshot, ReconcileError> {
        if let Some(expected) = self.expected {
            if self.entities.len() < expected {
                return Err(ReconcileError::IncompleteSnapshot {
                    expected,
                    observed: self.entities.len(),
                });
            }
        }
        debug!(
            observed_at = %format_date(self.observed_at),
            entities = self.entities.len(),
            "snapshot sealed"
        );
        Ok(Snapshot {
            observed_at: self.observed_at,
            entities: self.entities,
        })
    }
}
