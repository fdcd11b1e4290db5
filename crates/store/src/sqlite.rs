// SQLite-backed entity store

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde_json::{Map, Value};

use crate::collection::{Collection, NaturalKey};
use crate::document::{Document, DocumentId};
use crate::error::StoreError;
use crate::EntityStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    body TEXT NOT NULL,             -- JSON object, bookkeeping fields excluded
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,       -- RFC 3339, microseconds, UTC
    updated_at TEXT NOT NULL,
    UNIQUE (collection, natural_key)
);

CREATE TABLE IF NOT EXISTS last_change (
    collection TEXT PRIMARY KEY,
    last_modified TEXT NOT NULL     -- same format as above, compared lexically
);
"#;

const DOCUMENT_COLUMNS: &str = "id, body, version, created_at, updated_at";

/// Fixed-width timestamp format so that SQL `MAX` over text orders correctly.
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(collection: Collection, id: i64, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            collection: collection.to_string(),
            id,
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

/// Raw row as read from SQLite, decoded into a `Document` afterwards so that
/// decode failures surface as `StoreError::Corrupt` instead of SQL errors.
struct RawDocument {
    id: i64,
    body: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl RawDocument {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            body: row.get(1)?,
            version: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn decode(self, collection: Collection) -> Result<Document, StoreError> {
        let fields = match serde_json::from_str::<Value>(&self.body) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(StoreError::Corrupt {
                    collection: collection.to_string(),
                    id: self.id,
                    reason: format!("body is not an object: {other}"),
                })
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    collection: collection.to_string(),
                    id: self.id,
                    reason: e.to_string(),
                })
            }
        };

        Ok(Document {
            id: DocumentId(self.id),
            version: self.version,
            created_at: parse_ts(collection, self.id, &self.created_at)?,
            updated_at: parse_ts(collection, self.id, &self.updated_at)?,
            fields,
        })
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Unavailable(format!("cannot create schema: {e}")))?;
        Ok(Self { conn })
    }

    fn query_documents(
        &self,
        collection: Collection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Document>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let raws = stmt
            .query_map(args, RawDocument::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(|raw| raw.decode(collection)).collect()
    }

    fn map_write_error(err: rusqlite::Error, collection: Collection, key: &NaturalKey) -> StoreError {
        if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
            StoreError::Constraint {
                collection: collection.to_string(),
                key: key.to_string(),
            }
        } else {
            err.into()
        }
    }
}

fn encode_body(fields: &Map<String, Value>) -> Result<String, StoreError> {
    serde_json::to_string(fields).map_err(|e| StoreError::Query(format!("cannot encode body: {e}")))
}

impl EntityStore for SqliteStore {
    fn ping(&self) -> Result<(), StoreError> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn find(&self, collection: Collection, key: &NaturalKey) -> Result<Option<Document>, StoreError> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = ?1 AND natural_key = ?2"
        );
        let raw = self
            .conn
            .query_row(&sql, params![collection.as_str(), key.as_str()], RawDocument::from_row)
            .optional()?;
        raw.map(|r| r.decode(collection)).transpose()
    }

    fn find_by_field(
        &self,
        collection: Collection,
        field: &str,
        value: &str,
    ) -> Result<Vec<Document>, StoreError> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE collection = ?1 AND json_extract(body, ?2) = ?3 ORDER BY id"
        );
        let path = format!("$.\"{field}\"");
        self.query_documents(collection, &sql, &[&collection.as_str(), &path, &value])
    }

    fn get(&self, collection: Collection, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = ?1 AND id = ?2");
        let raw = self
            .conn
            .query_row(&sql, params![collection.as_str(), id.0], RawDocument::from_row)
            .optional()?;
        raw.map(|r| r.decode(collection)).transpose()
    }

    fn insert(
        &mut self,
        collection: Collection,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<DocumentId, StoreError> {
        let body = encode_body(fields)?;
        let now = format_ts(Utc::now());
        self.conn
            .execute(
                "INSERT INTO documents (collection, natural_key, body, version, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![collection.as_str(), key.as_str(), body, now],
            )
            .map_err(|e| Self::map_write_error(e, collection, key))?;
        Ok(DocumentId(self.conn.last_insert_rowid()))
    }

    fn replace(
        &mut self,
        collection: Collection,
        id: DocumentId,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let body = encode_body(fields)?;
        let now = format_ts(Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE documents SET natural_key = ?1, body = ?2, version = version + 1, updated_at = ?3 \
                 WHERE collection = ?4 AND id = ?5",
                params![key.as_str(), body, now, collection.as_str(), id.0],
            )
            .map_err(|e| Self::map_write_error(e, collection, key))?;
        if changed == 0 {
            return Err(StoreError::Query(format!("{collection}: no document {id}")));
        }
        Ok(())
    }

    fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn last_change(&self, collection: Collection) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT last_modified FROM last_change WHERE collection = ?1",
                params![collection.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| parse_ts(collection, 0, &r)).transpose()
    }

    fn touch_last_change(
        &mut self,
        collection: Collection,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.conn.execute(
            "INSERT INTO last_change (collection, last_modified) VALUES (?1, ?2) \
             ON CONFLICT(collection) DO UPDATE SET last_modified = MAX(last_modified, excluded.last_modified)",
            params![collection.as_str(), format_ts(at)],
        )?;
        self.last_change(collection)?.ok_or_else(|| {
            StoreError::Query(format!("{collection}: last change missing after upsert"))
        })
    }
}
