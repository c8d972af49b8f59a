//! # Utilities Module
//!
//! JSON-lines import/export for snapshots and history tables, and a plain-text summary.

use crate::model::{Entity, EntityVersion};
use crate::reconcile::ReconcileReport;
use crate::snapshot::{Snapshot, SnapshotBuilder};
use crate::store::HistoryTable;
use crate::temporal::{format_date, RunDate};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Parse JSON lines, skipping blank lines.
pub fn read_json_lines<T: DeserializeOwned, R: Read>(reader: R) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for (index, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid JSON record", index + 1))?;
        items.push(item);
    }
    Ok(items)
}

pub fn write_json_lines<T: Serialize, W: Write>(writer: W, items: &[T]) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Load a snapshot file (one JSON object per entity) observed on `observed_at`.
///
/// `expected` is the entry count the catalog declared, when the ingestor recorded it.
pub fn load_snapshot_file(
    path: &Path,
    observed_at: RunDate,
    expected: Option<usize>,
) -> Result<Snapshot> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let entities: Vec<Entity> = read_json_lines(file)?;
    let mut builder = SnapshotBuilder::new(observed_at);
    if let Some(expected) = expected {
        builder = builder.expect(expected);
    }
    builder.extend(entities);
    Ok(builder.finish()?)
}

pub fn load_history_file(path: &Path) -> Result<Vec<EntityVersion>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_json_lines(file)
}

pub fn write_history_file(path: &Path, rows: &[EntityVersion]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_json_lines(file, rows)
}

/// Export a history table as a text summary.
pub fn export_to_text_summary(table: &HistoryTable) -> String {
    let summary = table.summary();
    let mut text = String::new();
    text.push_str("History Summary\n");
    text.push_str("===============\n\n");
    text.push_str(&format!("Identities: {}\n", summary.identities));
    text.push_str(&format!("Open: {}\n", summary.open));
    text.push_str(&format!("Deleted: {}\n", summary.deleted));
    text.push_str(&format!("Retired at least once: {}\n", summary.ever_retired));
    text.push_str(&format!("Returned after retirement: {}\n", summary.returned));
    text.push_str(&format!("Edited at least once: {}\n", summary.edited));

    let mut recent: Vec<&EntityVersion> = table.deleted_rows().collect();
    recent.sort_by(|a, b| b.valid_to.cmp(&a.valid_to));
    if !recent.is_empty() {
        text.push_str("\nRecently removed:\n");
        for row in recent.iter().take(10) {
            let title = row
                .fields
                .get("title")
                .and_then(|value| value.as_str())
                .unwrap_or("<untitled>");
            let closed = row.valid_to.map(format_date).unwrap_or_default();
            text.push_str(&format!("  {} {} ({})\n", closed, title, row.identity_key.short()));
        }
    }
    text
}

/// One-line description of a run for logs and CLI output.
pub fn describe_run(run_date: RunDate, report: &ReconcileReport) -> String {
    format!("run {}: {}", format_date(run_date), report)
}
