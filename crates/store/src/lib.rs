//! `gipfelbuch-store`: persistent entity collections.
//!
//! Documents are loosely-typed JSON objects keyed by a per-collection natural
//! key. The store enforces natural-key uniqueness; it does not enforce
//! references between collections.

pub mod collection;
pub mod document;
pub mod error;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub use collection::{Collection, NaturalKey};
pub use document::{Document, DocumentId};
pub use error::StoreError;
pub use sqlite::SqliteStore;

/// Operations the reconciliation engine needs from a document store.
///
/// Every write is a single-document write; there is no cross-collection
/// transaction.
pub trait EntityStore {
    /// Connection-level health check. An error here aborts a whole run.
    fn ping(&self) -> Result<(), StoreError>;

    fn find(&self, collection: Collection, key: &NaturalKey) -> Result<Option<Document>, StoreError>;

    /// All documents whose top-level string `field` equals `value` exactly.
    fn find_by_field(
        &self,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> Result<Vec<Document>, StoreError>;

    fn get(&self, collection: Collection, id: DocumentId) -> Result<Option<Document>, StoreError>;

    fn insert(
        &mut self,
        collection: Collection,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<DocumentId, StoreError>;

    /// Replace the whole body of an existing document.
    fn replace(
        &mut self,
        collection: Collection,
        id: DocumentId,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<(), StoreError>;

    fn count(&self, collection: Collection) -> Result<usize, StoreError>;

    fn last_change(&self, collection: Collection) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Advance the collection's `lastModified` to `max(stored, at)` and return
    /// the stored value.
    fn touch_last_change(
        &mut self,
        collection: Collection,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError>;
}
