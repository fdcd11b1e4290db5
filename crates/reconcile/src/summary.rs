//! Run totals and the plain-text report table.

use std::fmt::Write;

use crate::model::{CollectionReport, OperationCounts, RunReport};

/// Sum of every source's counts across all collections.
pub fn run_totals(collections: &[CollectionReport]) -> OperationCounts {
    let mut totals = OperationCounts::default();
    for collection in collections {
        totals.add(&collection.totals);
    }
    totals
}

const HEADER: [&str; 7] = ["collection", "source", "inserted", "updated", "replaced", "skipped", "failed"];

/// Render a run report as an aligned table: one row per source, a total row
/// per collection, and a grand total.
pub fn render_table(report: &RunReport) -> String {
    let mut rows: Vec<[String; 7]> = Vec::new();
    for collection in &report.collections {
        let name = collection.collection.to_string();
        for source in &collection.sources {
            rows.push(row(&name, &source.source, &source.counts));
        }
        if collection.sources.len() > 1 {
            rows.push(row(&name, "(total)", &collection.totals));
        }
        if collection.created_by_reference > 0 {
            let created = OperationCounts {
                inserted: collection.created_by_reference,
                ..OperationCounts::default()
            };
            rows.push(row(&name, "(referenced)", &created));
        }
    }
    rows.push(row("TOTAL", "", &report.totals));

    let mut widths = HEADER.map(str::len);
    for r in &rows {
        for (w, cell) in widths.iter_mut().zip(r.iter()) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let header = HEADER.map(String::from);
    write_row(&mut out, &header, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let _ = writeln!(out, "{}", rule.join("  "));
    for r in &rows {
        write_row(&mut out, r, &widths);
    }
    out
}

fn row(collection: &str, source: &str, counts: &OperationCounts) -> [String; 7] {
    [
        collection.to_string(),
        source.to_string(),
        counts.inserted.to_string(),
        counts.updated.to_string(),
        counts.replaced.to_string(),
        counts.skipped.to_string(),
        counts.failed.to_string(),
    ]
}

fn write_row(out: &mut String, cells: &[String; 7], widths: &[usize; 7]) {
    let mut line = String::new();
    for (i, (cell, width)) in cells.iter().zip(widths.iter()).enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        // Names left-aligned, counts right-aligned.
        if i < 2 {
            let _ = write!(line, "{cell:<width$}");
        } else {
            let _ = write!(line, "{cell:>width$}");
        }
    }
    let _ = writeln!(out, "{}", line.trim_end());
}
