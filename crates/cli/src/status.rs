//! `gipfelbuch status`: what is in the store and when each collection last
//! changed. Consumers compare `last_modified` against their cached copy.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use gipfelbuch_config::Settings;
use gipfelbuch_store::{Collection, EntityStore};
use serde::Serialize;

use crate::exit_codes::{EXIT_ERROR, EXIT_RUNTIME};
use crate::{database_path, open_store, CliError};

#[derive(Debug, Serialize)]
struct CollectionStatus {
    collection: Collection,
    documents: usize,
    last_modified: Option<DateTime<Utc>>,
}

pub fn cmd_status(db: Option<PathBuf>, json_output: bool, settings: &Settings) -> Result<(), CliError> {
    let path = database_path(db, settings);
    let store = open_store(&path)?;
    let store_err = |e: gipfelbuch_store::StoreError| CliError::new(EXIT_RUNTIME, e.to_string());

    let mut rows = Vec::with_capacity(Collection::ORDERED.len());
    for collection in Collection::ORDERED {
        rows.push(CollectionStatus {
            collection,
            documents: store.count(collection).map_err(store_err)?,
            last_modified: store.last_change(collection).map_err(store_err)?,
        });
    }

    if json_output {
        let json = serde_json::json!({
            "database": path.display().to_string(),
            "collections": rows,
        });
        let out = serde_json::to_string_pretty(&json)
            .map_err(|e| CliError::new(EXIT_ERROR, format!("JSON serialization error: {e}")))?;
        println!("{out}");
        return Ok(());
    }

    println!("{}", path.display());
    println!("{:<10}  {:>9}  last modified", "collection", "documents");
    for row in &rows {
        let last = row
            .last_modified
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!("{:<10}  {:>9}  {}", row.collection.to_string(), row.documents, last);
    }
    Ok(())
}
