use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gipfelbuch_store::{Collection, EntityStore};

use crate::config::{ReconcileConfig, SourceRef};
use crate::error::{ApplyError, ReconcileError};
use crate::gps::GpsMergePolicy;
use crate::merge::MergeExecutor;
use crate::model::{
    CollectionReport, Outcome, ReconcileInput, RecordFailure, RunMeta, RunReport,
    SourceKind, SourceReport,
};
use crate::resolve::record_label;
use crate::summary::run_totals;

/// Reconcile every configured collection into `store`, in dependency order.
///
/// A configured source missing from `input` fails the run before any write.
/// After that, per-record problems are counted and logged; only an
/// unreachable store stops the run, leaving earlier writes in place.
pub fn run<S: EntityStore + ?Sized>(
    config: &ReconcileConfig,
    input: &ReconcileInput,
    store: &mut S,
) -> Result<RunReport, ReconcileError> {
    run_with_clock(config, input, store, Utc::now)
}

/// [`run`] with an explicit clock for LastChange timestamps.
pub fn run_with_clock<S: EntityStore + ?Sized>(
    config: &ReconcileConfig,
    input: &ReconcileInput,
    store: &mut S,
    clock: fn() -> DateTime<Utc>,
) -> Result<RunReport, ReconcileError> {
    check_sources(config, input)?;

    let run_at = clock();
    let mut executor = MergeExecutor::new(
        store,
        config.mode,
        GpsMergePolicy::from_config(&config.gps),
        config.references,
    );

    let mut collections: Vec<CollectionReport> = Vec::new();
    let mut created_by_reference: BTreeMap<Collection, (usize, DateTime<Utc>)> = BTreeMap::new();

    for collection in Collection::ORDERED {
        let sources = config.collections.ordered(collection);
        if sources.is_empty() {
            continue;
        }
        executor.store().ping()?;

        let mut report = CollectionReport::new(collection);
        for source in sources {
            let mut source_report = run_source(&mut executor, collection, source, input)?;
            // Regions and climbers created on the fly were written too.
            for (target, n) in executor.take_created() {
                let last_modified = executor.store().touch_last_change(target, clock())?;
                source_report.created_references += n;
                let entry = created_by_reference.entry(target).or_insert((0, last_modified));
                entry.0 += n;
                entry.1 = last_modified;
            }
            report.totals.add(&source_report.counts);
            report.sources.push(source_report);
        }

        if report.totals.writes() > 0 {
            report.last_modified = Some(executor.store().touch_last_change(collection, clock())?);
            report.changed = true;
        } else {
            report.last_modified = executor.store().last_change(collection)?;
        }

        log::info!("{collection}: {}", report.totals);
        collections.push(report);
    }

    for (target, (n, last_modified)) in created_by_reference {
        let i = match collections.iter().position(|c| c.collection == target) {
            Some(i) => i,
            None => {
                collections.push(CollectionReport::new(target));
                collections.len() - 1
            }
        };
        let report = &mut collections[i];
        report.created_by_reference += n;
        report.changed = true;
        report.last_modified = Some(last_modified);
    }
    collections.sort_by_key(|c| c.collection);

    let totals = run_totals(&collections);
    Ok(RunReport {
        meta: RunMeta {
            config_name: config.name.clone(),
            mode: config.mode,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: run_at.to_rfc3339(),
        },
        collections,
        totals,
    })
}

/// Every configured source must have records before anything is written.
fn check_sources(config: &ReconcileConfig, input: &ReconcileInput) -> Result<(), ReconcileError> {
    for collection in Collection::ORDERED {
        for source in config.collections.ordered(collection) {
            let name = source.data_source();
            if !input.records.contains_key(name) {
                return Err(unknown_source(collection, name));
            }
        }
    }
    Ok(())
}

fn unknown_source(collection: Collection, name: &str) -> ReconcileError {
    ReconcileError::UnknownSource {
        collection,
        source: name.to_string(),
    }
}

fn run_source<S: EntityStore + ?Sized>(
    executor: &mut MergeExecutor<'_, S>,
    collection: Collection,
    source: &SourceRef,
    input: &ReconcileInput,
) -> Result<SourceReport, ReconcileError> {
    let name = source.data_source();
    let records = input.records.get(name).ok_or_else(|| unknown_source(collection, name))?;

    let kind = if source.is_gps() { SourceKind::GpsLocation } else { SourceKind::Records };
    let mut report = SourceReport::new(name, kind);

    for (index, record) in records.iter().enumerate() {
        let label = record_label(collection, record);
        let result = match source {
            SourceRef::Named(_) => executor.apply(collection, record, &label),
            SourceRef::Gps(_) => executor.apply_gps(record, &label),
        };

        match result {
            Ok(outcome) => report.counts.record(outcome),
            Err(ApplyError::Record(err)) => {
                log::warn!(
                    "{collection} <- {name}: {} '{label}' rejected: {err}",
                    collection.entity_name()
                );
                report.counts.record(Outcome::Failed);
                report.failures.push(RecordFailure::new(index, label, &err));
            }
            Err(ApplyError::Fatal(err)) => {
                log::error!("{collection} <- {name}: store lost at record {index} ('{label}'): {err}");
                return Err(ReconcileError::Store(err));
            }
        }
    }

    log::debug!(
        "{collection} <- {name} ({} records, mode {}): {}",
        records.len(),
        executor.mode(),
        report.counts
    );
    Ok(report)
}
