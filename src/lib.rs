//! # Fundhist
//!
//! Temporal history reconstruction for a repeatedly scraped catalog of funding programs.
//!
//! Every scrape run yields a complete [`Snapshot`] of the entries visible on that day.
//! The [`Reconciler`] merges it into the accumulated history table: new entries open a
//! validity interval, vanished entries have theirs closed, reappearing entries reopen, and
//! every closing date ever recorded for an entry is kept in `previous_closures`.

pub mod config;
pub mod hasher;
pub mod model;
pub mod persistence;
pub mod reconcile;
pub mod snapshot;
pub mod store;
pub mod temporal;
pub mod utils;

// Re-export main types for convenience
pub use config::FundhistConfig;
pub use hasher::{compute_checksum, IdentityHasher};
pub use model::{Checksum, Entity, EntityVersion, Fields, IdentityKey};
pub use persistence::PersistentHistoryStore;
pub use reconcile::{
    verify_history, ContentChangePolicy, ReconcileConfig, ReconcileError, ReconcileReport,
    Reconciler, Reconciliation, TieWarning, ValidFromPolicy,
};
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use store::{HistoryStore, HistoryTable, MemoryHistoryStore};
pub use temporal::{RunDate, Validity};

use anyhow::Context;
use tracing::info;

/// Main API: a reconciler bound to a history store.
pub struct Fundhist {
    store: Box<dyn HistoryStore>,
    reconciler: Reconciler,
}

impl Fundhist {
    /// Create an instance over an in-memory store
    pub fn new(reconciler: Reconciler) -> Self {
        Self::with_store(reconciler, MemoryHistoryStore::new())
    }

    /// Create an instance with a custom store implementation.
    pub fn with_store<S>(reconciler: Reconciler, store: S) -> Self
    where
        S: HistoryStore + 'static,
    {
        Self {
            store: Box::new(store),
            reconciler,
        }
    }

    /// Build the reconciler and store described by `config`.
    pub fn from_config(config: &FundhistConfig) -> anyhow::Result<Self> {
        let reconciler = Reconciler::new(config.identity_hasher()?, config.reconcile.clone());
        let instance = match config.store.backend {
            config::StoreBackend::Memory => Self::new(reconciler),
            config::StoreBackend::Rocksdb => {
                let store = PersistentHistoryStore::open_with_options(
                    &config.store.data_dir,
                    persistence::PersistentOpenOptions {
                        repair: config.store.repair,
                    },
                )?;
                Self::with_store(reconciler, store)
            }
        };
        Ok(instance)
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn store(&self) -> &dyn HistoryStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn HistoryStore {
        self.store.as_mut()
    }

    /// Reconcile one complete snapshot against the stored history and write the
    /// next generation back. Nothing is written when the run is rejected.
    pub fn run(&mut self, snapshot: &Snapshot) -> anyhow::Result<ReconcileReport> {
        let history = self.store.load().context("loading history")?;
        let Reconciliation { rows, report } = self.reconciler.reconcile(snapshot, history)?;
        self.store
            .replace(&rows, snapshot.observed_at())
            .context("writing history")?;
        info!(
            run_date = %temporal::format_date(snapshot.observed_at()),
            rows = rows.len(),
            "run stored"
        );
        Ok(report)
    }

    /// Seed the store from an exported table, which may hold several rows per identity.
    /// Rows are consolidated to one per identity before anything is written.
    pub fn import(
        &mut self,
        rows: Vec<EntityVersion>,
        as_of: RunDate,
    ) -> anyhow::Result<ReconcileReport> {
        verify_history(&rows)?;
        let Reconciliation { rows, report } = self.reconciler.consolidate(rows, as_of)?;
        self.store
            .replace(&rows, as_of)
            .context("writing imported history")?;
        info!(
            as_of = %temporal::format_date(as_of),
            rows = rows.len(),
            "history imported"
        );
        Ok(report)
    }

    /// Compute the next generation without writing it.
    pub fn preview(&self, snapshot: &Snapshot) -> anyhow::Result<Reconciliation> {
        let history = self.store.load().context("loading history")?;
        Ok(self.reconciler.reconcile(snapshot, history)?)
    }

    /// Load the current generation as a queryable table.
    pub fn history(&self) -> anyhow::Result<HistoryTable> {
        Ok(HistoryTable::new(self.store.load()?))
    }

    /// Check the stored generation for broken invariants.
    pub fn verify(&self) -> anyhow::Result<()> {
        let rows = self.store.load()?;
        verify_history(&rows)?;
        Ok(())
    }

    /// Create a durable checkpoint of the underlying store, if supported.
    pub fn checkpoint(&self, path: &std::path::Path) -> anyhow::Result<()> {
        self.store.checkpoint(path)
    }
}
