//! # Reconciliation Module
//!
//! Merges one complete snapshot into the accumulated history table and emits the next
//! generation of that table.
//!
//! Per identity key the engine sees up to three inputs: the entity observed in the
//! snapshot, the open row (currently visible version) and the most recent retired row.
//! Closing happens inside the same call: an open row whose identity is missing from the
//! snapshot is stamped with the run date and marked deleted. Because the resulting row is
//! no longer open, a later run never closes it a second time.

use crate::hasher::IdentityHasher;
use crate::model::{insert_date, Checksum, Entity, EntityVersion, Fields, IdentityKey};
use crate::snapshot::Snapshot;
use crate::temporal::{format_date, is_ascending, ClosureLedger, RunDate};
use hashbrown::HashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// Which date a reappearing identity's open row starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidFromPolicy {
    /// Keep the `valid_from` recorded on the retired row
    #[default]
    PreserveOriginal,
    /// Start the new interval at the run date
    SnapshotDate,
}

/// What happens when a continuing identity's checksum differs from its carried row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentChangePolicy {
    /// Close the previous content version at the run date and open a new one
    #[default]
    Track,
    /// Overwrite the content in place without a version boundary
    Overwrite,
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub valid_from_policy: ValidFromPolicy,
    pub content_change_policy: ContentChangePolicy,
    /// Identity count above which the merge runs on the rayon pool
    pub parallel_threshold: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            valid_from_policy: ValidFromPolicy::default(),
            content_change_policy: ContentChangePolicy::default(),
            parallel_threshold: crate::config::DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

/// Errors that reject a whole run. Nothing is merged when one is returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("malformed snapshot: entity #{index} lacks identity fields {missing:?}")]
    MalformedSnapshot { index: usize, missing: Vec<String> },
    #[error("snapshot holds conflicting entities #{first} and #{second} for identity {identity_key}")]
    DuplicateIdentity {
        identity_key: IdentityKey,
        first: usize,
        second: usize,
    },
    #[error("incomplete snapshot: catalog declared {expected} entries, {observed} collected")]
    IncompleteSnapshot { expected: usize, observed: usize },
    #[error("invalid history for identity {identity_key}: {reason}")]
    InvalidHistory {
        identity_key: IdentityKey,
        reason: String,
    },
    #[error("run date {run_date} precedes latest history date {latest}")]
    StaleRun { run_date: RunDate, latest: RunDate },
}

/// Several closed rows share the latest closing date but carry different content.
/// Resolved by keeping the row that came first in the history input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieWarning {
    pub identity_key: IdentityKey,
    pub closed_at: RunDate,
    pub candidates: usize,
    pub kept_position: usize,
}

impl fmt::Display for TieWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ambiguous retired tie for {} at {}: {} candidates, kept history row #{}",
            self.identity_key.short(),
            format_date(self.closed_at),
            self.candidates,
            self.kept_position
        )
    }
}

/// How a row of the output came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// First sighting of the identity
    Created,
    /// Still visible, content unchanged
    Continued,
    /// Still visible, content changed and a new version opened
    Changed,
    /// Visible again after being retired
    Reopened,
    /// Vanished this run; the open row was closed
    Closed,
    /// Already retired and still absent
    Retired,
}

/// Counts per transition plus tie warnings for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub continued: usize,
    pub changed: usize,
    pub reopened: usize,
    pub closed: usize,
    pub retired: usize,
    pub ties: Vec<TieWarning>,
}

impl ReconcileReport {
    fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Created => self.created += 1,
            Transition::Continued => self.continued += 1,
            Transition::Changed => self.changed += 1,
            Transition::Reopened => self.reopened += 1,
            Transition::Closed => self.closed += 1,
            Transition::Retired => self.retired += 1,
        }
    }

    /// Rows that are open after the run
    pub fn open_rows(&self) -> usize {
        self.created + self.continued + self.changed + self.reopened
    }

    /// Rows flagged deleted after the run
    pub fn deleted_rows(&self) -> usize {
        self.closed + self.retired
    }

    pub fn total(&self) -> usize {
        self.open_rows() + self.deleted_rows()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} continued={} changed={} reopened={} closed={} retired={} ties={}",
            self.created,
            self.continued,
            self.changed,
            self.reopened,
            self.closed,
            self.retired,
            self.ties.len()
        )
    }
}

/// Next history generation plus what happened on the way.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// One row per identity key, ordered by key
    pub rows: Vec<EntityVersion>,
    pub report: ReconcileReport,
}

/// An entity of the current snapshot after hashing.
#[derive(Debug, Clone)]
struct Observed {
    position: usize,
    checksum: Checksum,
    fields: Fields,
}

/// Rows of one identity in the history input.
#[derive(Debug, Default)]
struct HistoryGroup {
    open: Option<EntityVersion>,
    closed: Vec<(usize, EntityVersion)>,
}

/// What the history knows about one identity, reduced for the merge.
#[derive(Debug)]
struct Prior {
    open: Option<EntityVersion>,
    retired: Option<EntityVersion>,
    closures: Vec<RunDate>,
    content_changes: Vec<RunDate>,
}

/// The reconciliation engine.
#[derive(Debug, Clone)]
pub struct Reconciler {
    hasher: IdentityHasher,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(hasher: IdentityHasher, config: ReconcileConfig) -> Self {
        Self { hasher, config }
    }

    pub fn hasher(&self) -> &IdentityHasher {
        &self.hasher
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Merge `snapshot` into `history`, returning the replacement history table.
    #[instrument(
        skip_all,
        fields(
            run_date = %format_date(snapshot.observed_at()),
            snapshot = snapshot.len(),
            history = history.len()
        )
    )]
    pub fn reconcile(
        &self,
        snapshot: &Snapshot,
        history: Vec<EntityVersion>,
    ) -> Result<Reconciliation, ReconcileError> {
        let run_date = snapshot.observed_at();
        let observed = self.index_snapshot(snapshot.entities())?;
        let groups = self.group_history(history, run_date)?;

        let mut report = ReconcileReport::default();
        let mut priors = reduce_history(groups, &mut report);

        let mut entries: Vec<(IdentityKey, Option<Observed>, Option<Prior>)> =
            Vec::with_capacity(observed.len() + priors.len());
        for (key, seen) in observed {
            let prior = priors.remove(&key);
            entries.push((key, Some(seen), prior));
        }
        entries.extend(priors.into_iter().map(|(key, prior)| (key, None, Some(prior))));
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let merged: Vec<(EntityVersion, Transition)> =
            if entries.len() >= self.config.parallel_threshold {
                debug!(identities = entries.len(), "merging on rayon pool");
                entries
                    .into_par_iter()
                    .map(|(key, seen, prior)| self.merge_identity(run_date, key, seen, prior))
                    .collect()
            } else {
                entries
                    .into_iter()
                    .map(|(key, seen, prior)| self.merge_identity(run_date, key, seen, prior))
                    .collect()
            };

        let mut rows = Vec::with_capacity(merged.len());
        for (row, transition) in merged {
            report.record(transition);
            rows.push(row);
        }

        info!(
            created = report.created,
            continued = report.continued,
            changed = report.changed,
            reopened = report.reopened,
            closed = report.closed,
            retired = report.retired,
            ties = report.ties.len(),
            "reconciliation complete"
        );
        Ok(Reconciliation { rows, report })
    }

    /// Collapse a history table holding several rows per identity into one row per
    /// identity, as of `as_of`, without observing a snapshot.
    ///
    /// Open rows stay open and keep their content; identities with only closed rows keep
    /// their most recently retired row, flagged deleted. Closures from every row are
    /// merged the same way a reconciliation run merges them.
    #[instrument(skip_all, fields(as_of = %format_date(as_of), history = history.len()))]
    pub fn consolidate(
        &self,
        history: Vec<EntityVersion>,
        as_of: RunDate,
    ) -> Result<Reconciliation, ReconcileError> {
        let groups = self.group_history(history, as_of)?;
        let mut report = ReconcileReport::default();
        let priors = reduce_history(groups, &mut report);

        let mut rows = Vec::with_capacity(priors.len());
        for (_, prior) in priors {
            let Prior {
                open,
                retired,
                closures,
                content_changes,
            } = prior;
            let (mut row, transition) = match (open, retired) {
                (Some(open), _) => (open, Transition::Continued),
                (None, Some(retired)) => (retired, Transition::Retired),
                // A group always holds an open or a closed row.
                (None, None) => continue,
            };
            row.deleted = transition == Transition::Retired;
            row.previous_closures = closures;
            row.content_changes = content_changes;
            report.record(transition);
            rows.push(row);
        }
        rows.sort_unstable_by(|a, b| a.identity_key.cmp(&b.identity_key));

        info!(
            rows = rows.len(),
            open = report.continued,
            retired = report.retired,
            "history consolidated"
        );
        Ok(Reconciliation { rows, report })
    }

    /// Hash every entity, rejecting the run on missing identity fields or conflicting duplicates.
    fn index_snapshot(
        &self,
        entities: &[Entity],
    ) -> Result<HashMap<IdentityKey, Observed>, ReconcileError> {
        let mut observed: HashMap<IdentityKey, Observed> = HashMap::with_capacity(entities.len());
        for (index, entity) in entities.iter().enumerate() {
            let missing = self.hasher.missing_identity_fields(entity);
            if !missing.is_empty() {
                return Err(ReconcileError::MalformedSnapshot { index, missing });
            }
            let key = self.hasher.identity_key(entity);
            let checksum = self.hasher.checksum(entity);
            match observed.get(&key) {
                Some(existing) if existing.checksum == checksum => {
                    debug!(identity = %key.short(), index, "duplicate entity collapsed");
                }
                Some(existing) => {
                    return Err(ReconcileError::DuplicateIdentity {
                        identity_key: key,
                        first: existing.position,
                        second: index,
                    });
                }
                None => {
                    observed.insert(
                        key,
                        Observed {
                            position: index,
                            checksum,
                            fields: entity.fields.clone(),
                        },
                    );
                }
            }
        }
        Ok(observed)
    }

    /// Split history into open and closed rows per identity and check its shape.
    fn group_history(
        &self,
        history: Vec<EntityVersion>,
        run_date: RunDate,
    ) -> Result<HashMap<IdentityKey, HistoryGroup>, ReconcileError> {
        let mut groups: HashMap<IdentityKey, HistoryGroup> = HashMap::new();
        let mut latest: Option<RunDate> = None;

        for (position, mut row) in history.into_iter().enumerate() {
            if row.checksum.0.is_empty() {
                row.checksum = self.hasher.checksum_fields_of(&row.fields);
            }
            if let Some(to) = row.valid_to {
                if to < row.valid_from {
                    return Err(ReconcileError::InvalidHistory {
                        identity_key: row.identity_key,
                        reason: format!(
                            "closed at {} before opening at {}",
                            format_date(to),
                            format_date(row.valid_from)
                        ),
                    });
                }
            }
            if !is_ascending(&row.previous_closures) {
                return Err(ReconcileError::InvalidHistory {
                    identity_key: row.identity_key,
                    reason: "previous closures are not ascending".to_string(),
                });
            }
            if !is_ascending(&row.content_changes) {
                return Err(ReconcileError::InvalidHistory {
                    identity_key: row.identity_key,
                    reason: "content changes are not ascending".to_string(),
                });
            }

            let row_latest = [
                Some(row.valid_from),
                row.valid_to,
                row.last_closed_at(),
                row.content_changes.last().copied(),
            ]
            .into_iter()
            .flatten()
            .max();
            latest = latest.max(row_latest);

            let group = groups.entry(row.identity_key.clone()).or_default();
            if row.is_open() {
                if group.open.is_some() {
                    return Err(ReconcileError::InvalidHistory {
                        identity_key: row.identity_key,
                        reason: "more than one open row".to_string(),
                    });
                }
                group.open = Some(row);
            } else {
                group.closed.push((position, row));
            }
        }

        if let Some(latest) = latest {
            if run_date < latest {
                return Err(ReconcileError::StaleRun { run_date, latest });
            }
        }
        Ok(groups)
    }

    fn merge_identity(
        &self,
        run_date: RunDate,
        key: IdentityKey,
        seen: Option<Observed>,
        prior: Option<Prior>,
    ) -> (EntityVersion, Transition) {
        match (seen, prior) {
            (Some(seen), None) => (
                EntityVersion::open(key, seen.checksum, seen.fields, run_date),
                Transition::Created,
            ),
            (Some(seen), Some(prior)) => self.merge_visible(run_date, key, seen, prior),
            (None, Some(prior)) => merge_absent(run_date, prior),
            // Every key originates from the snapshot or the history.
            (None, None) => unreachable!("identity {key} has neither snapshot nor history"),
        }
    }

    fn merge_visible(
        &self,
        run_date: RunDate,
        key: IdentityKey,
        seen: Observed,
        prior: Prior,
    ) -> (EntityVersion, Transition) {
        let Prior {
            open,
            retired,
            closures,
            mut content_changes,
        } = prior;
        let track_changes = self.config.content_change_policy == ContentChangePolicy::Track;

        if let Some(open) = open {
            // Compare what will be stored, so omitted fields filled from the open row
            // never count as an edit.
            let fields = coalesce(seen.fields, &open.fields);
            let checksum = self.hasher.checksum_fields_of(&fields);
            let changed = open.checksum != checksum;
            let (valid_from, transition) = if changed && track_changes {
                insert_date(&mut content_changes, run_date);
                (run_date, Transition::Changed)
            } else {
                (open.valid_from, Transition::Continued)
            };
            let row = EntityVersion {
                identity_key: key,
                checksum,
                fields,
                valid_from,
                valid_to: None,
                previous_closures: closures,
                content_changes,
                deleted: false,
            };
            return (row, transition);
        }

        let Some(retired) = retired else {
            return (
                EntityVersion {
                    previous_closures: closures,
                    content_changes,
                    ..EntityVersion::open(key, seen.checksum, seen.fields, run_date)
                },
                Transition::Created,
            );
        };

        // The retired content version already ended at its `valid_to`.
        let fields = coalesce(seen.fields, &retired.fields);
        let checksum = self.hasher.checksum_fields_of(&fields);
        let changed = retired.checksum != checksum;
        let valid_from = if changed && track_changes {
            insert_date(&mut content_changes, run_date);
            run_date
        } else {
            match self.config.valid_from_policy {
                ValidFromPolicy::PreserveOriginal => retired.valid_from,
                ValidFromPolicy::SnapshotDate => run_date,
            }
        };
        let row = EntityVersion {
            identity_key: key,
            checksum,
            fields,
            valid_from,
            valid_to: None,
            previous_closures: closures,
            content_changes,
            deleted: false,
        };
        (row, Transition::Reopened)
    }
}

/// Identity absent from the snapshot: close its open row or carry the retired row.
fn merge_absent(run_date: RunDate, prior: Prior) -> (EntityVersion, Transition) {
    let Prior {
        open,
        retired,
        closures,
        content_changes,
    } = prior;

    if let Some(mut row) = open {
        row.previous_closures = closures;
        row.content_changes = content_changes;
        row.close(run_date);
        row.deleted = true;
        return (row, Transition::Closed);
    }

    match retired {
        Some(mut row) => {
            row.previous_closures = closures;
            row.content_changes = content_changes;
            row.deleted = true;
            (row, Transition::Retired)
        }
        // A group always holds an open or a closed row.
        None => unreachable!("history group without rows"),
    }
}

/// Reduce every history group, logging and collecting tie warnings in key order.
fn reduce_history(
    groups: HashMap<IdentityKey, HistoryGroup>,
    report: &mut ReconcileReport,
) -> HashMap<IdentityKey, Prior> {
    let mut priors: HashMap<IdentityKey, Prior> = HashMap::with_capacity(groups.len());
    for (key, group) in groups {
        let (prior, tie) = reduce_group(&key, group);
        if let Some(tie) = tie {
            warn!(
                identity = %tie.identity_key.short(),
                closed_at = %format_date(tie.closed_at),
                candidates = tie.candidates,
                "ambiguous retired tie resolved by history order"
            );
            report.ties.push(tie);
        }
        priors.insert(key, prior);
    }
    report.ties.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
    priors
}

/// Collapse one identity's history rows into the open row, the most recent retired row,
/// the full closure list and the content change dates.
fn reduce_group(key: &IdentityKey, group: HistoryGroup) -> (Prior, Option<TieWarning>) {
    let HistoryGroup { open, closed } = group;

    let mut ledger = ClosureLedger::new();
    let mut content_changes = Vec::new();
    if let Some(open) = &open {
        ledger.carry(&open.previous_closures);
        content_changes.extend_from_slice(&open.content_changes);
    }
    for (_, row) in &closed {
        ledger.carry(&row.previous_closures);
        content_changes.extend_from_slice(&row.content_changes);
        if let Some(to) = row.valid_to {
            ledger.stamp(to);
        }
    }
    // Rows of one identity repeat the same edit dates.
    content_changes.sort_unstable();
    content_changes.dedup();

    let latest = closed.iter().filter_map(|(_, row)| row.valid_to).max();
    let mut tie = None;
    let mut retired = None;
    if let Some(latest) = latest {
        let mut candidates = closed
            .into_iter()
            .filter(|(_, row)| row.valid_to == Some(latest))
            .collect::<Vec<_>>();
        // History positions are ascending already; the first candidate wins.
        let count = candidates.len();
        let (kept_position, kept) = candidates.remove(0);
        if candidates.iter().any(|(_, row)| row.checksum != kept.checksum) {
            tie = Some(TieWarning {
                identity_key: key.clone(),
                closed_at: latest,
                candidates: count,
                kept_position,
            });
        }
        retired = Some(kept);
    }

    let prior = Prior {
        open,
        retired,
        closures: ledger.into_sorted(),
        content_changes,
    };
    (prior, tie)
}

/// Prefer the newly observed values; fall back to prior values for omitted or null fields.
fn coalesce(mut fresh: Fields, prior: &Fields) -> Fields {
    for (name, value) in prior {
        let missing = fresh.get(name).is_none_or(|current| current.is_null());
        if missing {
            fresh.insert(name.clone(), value.clone());
        }
    }
    fresh
}

/// Check a history table for the invariants the engine maintains.
pub fn verify_history(rows: &[EntityVersion]) -> Result<(), ReconcileError> {
    let mut open_seen: HashMap<&IdentityKey, usize> = HashMap::new();
    for row in rows {
        if let Some(to) = row.valid_to {
            if to < row.valid_from {
                return Err(ReconcileError::InvalidHistory {
                    identity_key: row.identity_key.clone(),
                    reason: "closed before it opened".to_string(),
                });
            }
        }
        if !is_ascending(&row.previous_closures) {
            return Err(ReconcileError::InvalidHistory {
                identity_key: row.identity_key.clone(),
                reason: "previous closures are not ascending".to_string(),
            });
        }
        if !is_ascending(&row.content_changes) {
            return Err(ReconcileError::InvalidHistory {
                identity_key: row.identity_key.clone(),
                reason: "content changes are not ascending".to_string(),
            });
        }
        if row.deleted && row.is_open() {
            return Err(ReconcileError::InvalidHistory {
                identity_key: row.identity_key.clone(),
                reason: "open row flagged deleted".to_string(),
            });
        }
        if row.is_open() {
            let count = open_seen.entry(&row.identity_key).or_insert(0);
            *count += 1;
            if *count > 1 {
                return Err(ReconcileError::InvalidHistory {
                    identity_key: row.identity_key.clone(),
                    reason: "more than one open row".to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotBuilder;
    use time::macros::date;

    fn hasher() -> IdentityHasher {
        IdentityHasher::new(
            vec!["url".to_string()],
            vec!["title".to_string(), "url".to_string()],
        )
        .unwrap()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(hasher(), ReconcileConfig::default())
    }

    fn entry(url: &str, title: &str) -> Entity {
        Entity::new().with("url", url).with("title", title)
    }

    fn snapshot(date: RunDate, entities: Vec<Entity>) -> Snapshot {
        let mut builder = SnapshotBuilder::new(date);
        builder.extend(entities);
        builder.finish().unwrap()
    }

    fn row_for<'a>(rows: &'a [EntityVersion], url: &str) -> &'a EntityVersion {
        let key = hasher().identity_key(&Entity::new().with("url", url));
        rows.iter()
            .find(|row| row.identity_key == key)
            .expect("row for url")
    }

    #[test]
    fn test_new_identity_opens_row() {
        let result = reconciler()
            .reconcile(&snapshot(date!(2024 - 04 - 01), vec![entry("b", "B")]), Vec::new())
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert!(row.is_open());
        assert!(row.previous_closures.is_empty());
        assert!(!row.deleted);
        assert_eq!(row.valid_from, date!(2024 - 04 - 01));
        assert_eq!(result.report.created, 1);
    }

    #[test]
    fn test_vanished_open_row_is_closed_once() {
        let engine = reconciler();
        let first = engine
            .reconcile(&snapshot(date!(2024 - 01 - 01), vec![entry("c", "C")]), Vec::new())
            .unwrap();
        let second = engine
            .reconcile(&snapshot(date!(2024 - 02 - 01), Vec::new()), first.rows)
            .unwrap();
        let row = &second.rows[0];
        assert_eq!(row.valid_to, Some(date!(2024 - 02 - 01)));
        assert_eq!(row.previous_closures, vec![date!(2024 - 02 - 01)]);
        assert!(row.deleted);
        assert_eq!(second.report.closed, 1);

        let third = engine
            .reconcile(&snapshot(date!(2024 - 03 - 01), Vec::new()), second.rows)
            .unwrap();
        let row = &third.rows[0];
        assert_eq!(row.valid_to, Some(date!(2024 - 02 - 01)));
        assert_eq!(row.previous_closures, vec![date!(2024 - 02 - 01)]);
        assert!(row.deleted);
        assert_eq!(third.report.retired, 1);
    }

    #[test]
    fn test_content_change_tracked() {
        let engine = reconciler();
        let first = engine
            .reconcile(&snapshot(date!(2024 - 01 - 01), vec![entry("a", "Old")]), Vec::new())
            .unwrap();
        let second = engine
            .reconcile(&snapshot(date!(2024 - 02 - 01), vec![entry("a", "New")]), first.rows)
            .unwrap();
        let row = &second.rows[0];
        assert!(row.is_open());
        assert_eq!(row.valid_from, date!(2024 - 02 - 01));
        assert!(row.previous_closures.is_empty());
        assert_eq!(row.content_changes, vec![date!(2024 - 02 - 01)]);
        assert_eq!(row.fields["title"], "New");
        assert_eq!(second.report.changed, 1);
    }

    #[test]
    fn test_content_change_overwrite() {
        let engine = Reconciler::new(
            hasher(),
            ReconcileConfig {
                content_change_policy: ContentChangePolicy::Overwrite,
                ..ReconcileConfig::default()
            },
        );
        let first = engine
            .reconcile(&snapshot(date!(2024 - 01 - 01), vec![entry("a", "Old")]), Vec::new())
            .unwrap();
        let second = engine
            .reconcile(&snapshot(date!(2024 - 02 - 01), vec![entry("a", "New")]), first.rows)
            .unwrap();
        let row = &second.rows[0];
        assert_eq!(row.valid_from, date!(2024 - 01 - 01));
        assert!(row.previous_closures.is_empty());
        assert_eq!(row.fields["title"], "New");
        assert_eq!(second.report.continued, 1);
    }

    #[test]
    fn test_coalesce_fills_omitted_fields() {
        let engine = reconciler();
        let first = engine
            .reconcile(
                &snapshot(
                    date!(2024 - 01 - 01),
                    vec![entry("a", "A").with("region", "Bayern")],
                ),
                Vec::new(),
            )
            .unwrap();
        let second = engine
            .reconcile(
                &snapshot(
                    date!(2024 - 02 - 01),
                    vec![entry("a", "A").with("region", serde_json::Value::Null)],
                ),
                first.rows,
            )
            .unwrap();
        assert_eq!(second.rows[0].fields["region"], "Bayern");
    }

    #[test]
    fn test_malformed_snapshot_rejects_run() {
        let result = reconciler().reconcile(
            &snapshot(
                date!(2024 - 01 - 01),
                vec![entry("a", "A"), Entity::new().with("title", "no url")],
            ),
            Vec::new(),
        );
        assert_eq!(
            result.unwrap_err(),
            ReconcileError::MalformedSnapshot {
                index: 1,
                missing: vec!["url".to_string()]
            }
        );
    }

    #[test]
    fn test_conflicting_duplicates_reject_run() {
        let result = reconciler().reconcile(
            &snapshot(date!(2024 - 01 - 01), vec![entry("a", "A"), entry("a", "B")]),
            Vec::new(),
        );
        assert!(matches!(
            result,
            Err(ReconcileError::DuplicateIdentity {
                first: 0,
                second: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_identical_duplicates_collapse() {
        let result = reconciler()
            .reconcile(
                &snapshot(date!(2024 - 01 - 01), vec![entry("a", "A"), entry("a", "A")]),
                Vec::new(),
            )
            .unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_two_open_rows_rejected() {
        let engine = reconciler();
        let first = engine
            .reconcile(&snapshot(date!(2024 - 01 - 01), vec![entry("a", "A")]), Vec::new())
            .unwrap();
        let mut history = first.rows.clone();
        history.extend(first.rows);
        let result = engine.reconcile(&snapshot(date!(2024 - 02 - 01), Vec::new()), history);
        assert!(matches!(result, Err(ReconcileError::InvalidHistory { .. })));
    }

    #[test]
    fn test_stale_run_rejected() {
        let engine = reconciler();
        let first = engine
            .reconcile(&snapshot(date!(2024 - 03 - 01), vec![entry("a", "A")]), Vec::new())
            .unwrap();
        let result = engine.reconcile(&snapshot(date!(2024 - 02 - 01), Vec::new()), first.rows);
        assert_eq!(
            result.unwrap_err(),
            ReconcileError::StaleRun {
                run_date: date!(2024 - 02 - 01),
                latest: date!(2024 - 03 - 01)
            }
        );
    }

    #[test]
    fn test_retired_tie_warns_and_keeps_first_row() {
        let hasher = hasher();
        let key = hasher.identity_key(&entry("t", "x"));
        let closed = |title: &str| {
            let fields = entry("t", title).fields;
            EntityVersion {
                identity_key: key.clone(),
                checksum: hasher.checksum_fields_of(&fields),
                fields,
                valid_from: date!(2024 - 01 - 01),
                valid_to: Some(date!(2024 - 02 - 01)),
                previous_closures: Vec::new(),
                content_changes: Vec::new(),
                deleted: false,
            }
        };
        let history = vec![closed("First"), closed("Second")];
        let result = reconciler()
            .reconcile(&snapshot(date!(2024 - 03 - 01), Vec::new()), history)
            .unwrap();

        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].fields["title"], "First");
        assert_eq!(result.report.ties.len(), 1);
        assert_eq!(result.report.ties[0].candidates, 2);
        assert_eq!(result.report.ties[0].kept_position, 0);
        // Two distinct rows were closed on the same day.
        assert_eq!(result.rows[0].previous_closures.len(), 2);
    }

    #[test]
    fn test_omitted_field_is_not_an_edit() {
        let engine = reconciler();
        let first = engine
            .reconcile(&snapshot(date!(2024 - 01 - 01), vec![entry("a", "T")]), Vec::new())
            .unwrap();
        let partial = Entity::new().with("url", "a");
        let second = engine
            .reconcile(&snapshot(date!(2024 - 02 - 01), vec![partial]), first.rows.clone())
            .unwrap();
        let row = &second.rows[0];
        assert_eq!(second.report.changed, 0);
        assert_eq!(second.report.continued, 1);
        assert_eq!(row.valid_from, date!(2024 - 01 - 01));
        assert_eq!(row.fields["title"], "T");
        assert_eq!(row.checksum, first.rows[0].checksum);
        assert!(row.content_changes.is_empty());

        let third = engine
            .reconcile(&snapshot(date!(2024 - 03 - 01), vec![entry("a", "T")]), second.rows)
            .unwrap();
        assert_eq!(third.report.changed, 0);
        assert_eq!(third.rows[0].valid_from, date!(2024 - 01 - 01));
    }

    #[test]
    fn test_consolidate_collapses_closed_rows() {
        let hasher = hasher();
        let key = hasher.identity_key(&entry("m", "x"));
        let closed = |from, to| {
            let fields = entry("m", "M").fields;
            EntityVersion {
                identity_key: key.clone(),
                checksum: Checksum::default(),
                fields,
                valid_from: from,
                valid_to: Some(to),
                previous_closures: Vec::new(),
                content_changes: Vec::new(),
                deleted: false,
            }
        };
        let history = vec![
            closed(date!(2023 - 12 - 01), date!(2024 - 01 - 01)),
            closed(date!(2024 - 02 - 01), date!(2024 - 03 - 01)),
            EntityVersion::open(
                hasher.identity_key(&entry("n", "N")),
                Checksum::default(),
                entry("n", "N").fields,
                date!(2024 - 01 - 15),
            ),
        ];

        let result = reconciler()
            .consolidate(history, date!(2024 - 04 - 01))
            .unwrap();
        assert_eq!(result.rows.len(), 2);
        verify_history(&result.rows).unwrap();

        let retired = row_for(&result.rows, "m");
        assert!(retired.deleted);
        assert_eq!(retired.valid_from, date!(2024 - 02 - 01));
        assert_eq!(retired.valid_to, Some(date!(2024 - 03 - 01)));
        assert_eq!(
            retired.previous_closures,
            vec![date!(2024 - 01 - 01), date!(2024 - 03 - 01)]
        );
        assert_eq!(retired.checksum, hasher.checksum(&entry("m", "M")));

        let open = row_for(&result.rows, "n");
        assert!(open.is_open());
        assert!(!open.deleted);
        assert_eq!(result.report.retired, 1);
        assert_eq!(result.report.continued, 1);
    }

    #[test]
    fn test_consolidate_rejects_future_history() {
        let row = EntityVersion::open(
            IdentityKey("k".to_string()),
            Checksum("c".to_string()),
            Fields::new(),
            date!(2024 - 05 - 01),
        );
        let err = reconciler()
            .consolidate(vec![row], date!(2024 - 04 - 01))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::StaleRun { .. }));
    }

    #[test]
    fn test_parallel_and_sequential_agree() {
        let entities: Vec<Entity> = (0..200)
            .map(|i| entry(&format!("u{i}"), &format!("T{i}")))
            .collect();
        let sequential = Reconciler::new(
            hasher(),
            ReconcileConfig {
                parallel_threshold: usize::MAX,
                ..ReconcileConfig::default()
            },
        );
        let parallel = Reconciler::new(
            hasher(),
            ReconcileConfig {
                parallel_threshold: 1,
                ..ReconcileConfig::default()
            },
        );
        let snap = snapshot(date!(2024 - 01 - 01), entities);
        let a = sequential.reconcile(&snap, Vec::new()).unwrap();
        let b = parallel.reconcile(&snap, Vec::new()).unwrap();
        assert_eq!(a.rows, b.rows);
    }

    #[test]
    fn test_verify_history_catches_deleted_open_row() {
        let mut row = EntityVersion::open(
            IdentityKey("k".to_string()),
            Checksum::default(),
            Fields::new(),
            date!(2024 - 01 - 01),
        );
        assert!(verify_history(std::slice::from_ref(&row)).is_ok());
        row.deleted = true;
        assert!(verify_history(&[row]).is_err());
    }
}
