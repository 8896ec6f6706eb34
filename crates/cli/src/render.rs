//! Console rendering of diff reports.

use std::io::{self, Write};

use kubediff_core::{AggregationTable, DiffEntry, DiffMode, DiffReport, ResourceKind};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// One namespace × kind × path comparison.
#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub namespace: String,
    pub kind: ResourceKind,
    pub path: String,
    pub contexts: Vec<String>,
    pub differences: DiffReport,
}

fn ns_label(ns: &str) -> &str {
    if ns.is_empty() { "(all)" } else { ns }
}

pub fn human<W: Write>(out: &mut W, mode: &DiffMode, section: &Section, table: &AggregationTable) -> io::Result<()> {
    if section.differences.is_empty() {
        info!(ns = %ns_label(&section.namespace), resource = %section.kind, path = %section.path, "No differences found");
        return Ok(());
    }
    match mode {
        DiffMode::Images { .. } => image_table(out, mode, section, table),
        DiffMode::Generic | DiffMode::Envs { .. } => blocks(out, section),
    }
}

/// Per-resource blocks: absence and cardinality first, then value details per pair.
fn blocks<W: Write>(out: &mut W, section: &Section) -> io::Result<()> {
    for (resource, entries) in section.differences.iter() {
        warn!(resource, kind = %section.kind, ns = %ns_label(&section.namespace), "Found differences");
        writeln!(out, "{} ({} in {})", resource, section.kind, ns_label(&section.namespace))?;
        for e in entries {
            if !matches!(e, DiffEntry::ValueMismatch { .. }) {
                writeln!(out, "\t{}", e)?;
            }
        }
        let mut current: Option<(&str, &str)> = None;
        for e in entries {
            if let DiffEntry::ValueMismatch { source_a, source_b, .. } = e {
                let pair = (source_a.as_str(), source_b.as_str());
                if current != Some(pair) {
                    writeln!(out, "\tDifference between {} and {}:", pair.0, pair.1)?;
                    current = Some(pair);
                }
                writeln!(out, "\t\t{}", e)?;
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Values as compared, so a stripped registry does not show up as drift.
fn cell(mode: &DiffMode, values: Option<&[Value]>) -> String {
    match values {
        None => "-".to_string(),
        Some(vals) => {
            let parts: Vec<String> = vals
                .iter()
                .map(|v| match mode.transform(v) {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect();
            format!("[{}]", parts.join(" "))
        }
    }
}

/// `NAME NAMESPACE <ctx>...` with one row per drifting resource.
fn image_table<W: Write>(out: &mut W, mode: &DiffMode, section: &Section, table: &AggregationTable) -> io::Result<()> {
    let mut header = vec!["NAME".to_string(), "NAMESPACE".to_string()];
    header.extend(section.contexts.iter().cloned());
    let mut rows = vec![header];
    for resource in section.differences.resources() {
        warn!(resource, kind = %section.kind, path = %section.path, "Found differences");
        let mut row = vec![resource.to_string(), ns_label(&section.namespace).to_string()];
        row.extend(section.contexts.iter().map(|ctx| cell(mode, table.get(resource, ctx))));
        rows.push(row);
    }

    let cols = rows[0].len();
    let widths: Vec<usize> =
        (0..cols).map(|c| rows.iter().map(|r| r[c].chars().count()).max().unwrap_or(0)).collect();
    writeln!(out, "{}", section.path)?;
    for row in &rows {
        let line: Vec<String> = row.iter().zip(&widths).map(|(v, w)| format!("{:<width$}", v, width = w)).collect();
        writeln!(out, "{}", line.join(" ").trim_end())?;
    }
    writeln!(out)?;
    Ok(())
}
