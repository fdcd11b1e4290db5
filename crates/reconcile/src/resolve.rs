//! Foreign key resolution.
//!
//! Source records name related entities by natural key ("summit": "Lokomotive").
//! Resolution validates the record's shape, swaps every such name for the
//! referenced document's id, and computes the record's own natural key.
//! Lookups are exact and case-sensitive; a missing reference rejects the
//! record. Nothing is written here.

use chrono::NaiveDate;
use gipfelbuch_store::{Collection, Document, DocumentId, EntityStore, NaturalKey};
use serde_json::{Map, Value};

use crate::detect::EXCLUDED_FIELDS;
use crate::error::{ApplyError, RecordError};
use crate::gps::{GpsPosition, POSITION_FIELD};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A record with references replaced by ids, ready to be merged.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub key: NaturalKey,
    pub fields: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Shape helpers
// ---------------------------------------------------------------------------

fn as_object(record: &Value) -> Result<&Map<String, Value>, RecordError> {
    record
        .as_object()
        .ok_or_else(|| RecordError::Shape(format!("expected an object, got {record}")))
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str, RecordError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(RecordError::Shape(format!("'{field}' is empty"))),
        Some(other) => Err(RecordError::Shape(format!("'{field}' must be a string, got {other}"))),
        None => Err(RecordError::Shape(format!("missing '{field}'"))),
    }
}

pub(crate) fn optional_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<Option<&'a str>, RecordError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_str(obj, field).map(Some),
    }
}

fn expect_kind(obj: &Map<String, Value>, field: &str, kind: &str, ok: fn(&Value) -> bool) -> Result<(), RecordError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(()),
        Some(v) if ok(v) => Ok(()),
        Some(v) => Err(RecordError::Shape(format!("'{field}' must be {kind}, got {v}"))),
    }
}

/// Copy of the record without bookkeeping fields a source may carry.
fn body_of(obj: &Map<String, Value>) -> Map<String, Value> {
    obj.iter()
        .filter(|(k, _)| !EXCLUDED_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn id_field(fields: &Map<String, Value>, field: &str) -> Result<DocumentId, RecordError> {
    fields
        .get(field)
        .and_then(DocumentId::from_value)
        .ok_or_else(|| RecordError::Shape(format!("'{field}' is not a resolved reference")))
}

/// Split "Bernd Arnold" into ("Bernd", "Arnold"). The first whitespace
/// separates the first name; everything after it is the last name.
pub fn split_full_name(name: &str) -> Option<(&str, &str)> {
    let (first, last) = name.trim().split_once(char::is_whitespace)?;
    let last = last.trim();
    if first.is_empty() || last.is_empty() {
        None
    } else {
        Some((first, last))
    }
}

// ---------------------------------------------------------------------------
// Keys and labels
// ---------------------------------------------------------------------------

/// Natural key of a resolved body.
pub fn natural_key(collection: Collection, fields: &Map<String, Value>) -> Result<NaturalKey, RecordError> {
    let key = match collection {
        Collection::Regions => NaturalKey::new([required_str(fields, "name")?]),
        Collection::Summits => NaturalKey::new([
            required_str(fields, "name")?.to_string(),
            id_field(fields, "region")?.0.to_string(),
        ]),
        Collection::Routes => NaturalKey::new([
            required_str(fields, "name")?.to_string(),
            id_field(fields, "summit")?.0.to_string(),
        ]),
        Collection::Climbers => NaturalKey::new([
            required_str(fields, "firstName")?,
            required_str(fields, "lastName")?,
        ]),
        Collection::Ascents => {
            let lead = match fields.get("leadClimber") {
                None | Some(Value::Null) => String::new(),
                Some(_) => id_field(fields, "leadClimber")?.0.to_string(),
            };
            NaturalKey::new([
                required_str(fields, "date")?.to_string(),
                id_field(fields, "route")?.0.to_string(),
                lead,
            ])
        }
    };
    Ok(key)
}

/// Human-readable identity of a raw record, attached to every warning about it.
pub fn record_label(collection: Collection, record: &Value) -> String {
    let text = |field: &str| record.get(field).and_then(Value::as_str);
    let label = match collection {
        Collection::Regions => text("name").map(str::to_string),
        Collection::Summits => text("name").map(|name| match text("region") {
            Some(region) => format!("{name} ({region})"),
            None => name.to_string(),
        }),
        Collection::Routes => text("name").map(|name| match text("summit") {
            Some(summit) => format!("{name} @ {summit}"),
            None => name.to_string(),
        }),
        Collection::Climbers => match (text("firstName"), text("lastName")) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            _ => text("name").map(str::to_string),
        },
        Collection::Ascents => text("date").map(|date| match (text("route"), text("summit")) {
            (Some(route), Some(summit)) => format!("{date} {route} @ {summit}"),
            (Some(route), None) => format!("{date} {route}"),
            _ => date.to_string(),
        }),
    };
    label.unwrap_or_else(|| "<unnamed>".into())
}

// ---------------------------------------------------------------------------
// Reference lookups
// ---------------------------------------------------------------------------

/// Id handed out for a planned reference. Store ids start at 1.
const PLANNED_ID: DocumentId = DocumentId(0);

/// A region or climber that does not exist yet and can be created from its
/// name alone.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReference {
    pub entity: &'static str,
    pub name: String,
    pub collection: Collection,
    pub key: NaturalKey,
    pub fields: Map<String, Value>,
}

impl NewReference {
    /// The document to create for a missing reference, if `entity` is one
    /// that can be created.
    pub fn for_missing(entity: &'static str, name: &str) -> Option<Self> {
        let mut fields = Map::new();
        let (collection, key) = match entity {
            "region" => {
                fields.insert("name".into(), Value::from(name));
                (Collection::Regions, NaturalKey::new([name]))
            }
            "climber" => {
                let (first, last) = split_full_name(name)?;
                fields.insert("firstName".into(), Value::from(first));
                fields.insert("lastName".into(), Value::from(last));
                (Collection::Climbers, NaturalKey::new([first, last]))
            }
            _ => return None,
        };
        Some(Self { entity, name: name.to_string(), collection, key, fields })
    }
}

/// Read-only view of the store used during resolution. References in
/// `planned` count as present, so a record can be checked in full before
/// anything it needs is written.
pub struct Lookup<'a, S: EntityStore + ?Sized> {
    store: &'a S,
    planned: &'a [NewReference],
}

impl<'a, S: EntityStore + ?Sized> Lookup<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store, planned: &[] }
    }

    pub fn with_planned(store: &'a S, planned: &'a [NewReference]) -> Self {
        Self { store, planned }
    }

    fn find_id(&self, collection: Collection, key: &NaturalKey) -> Result<Option<DocumentId>, ApplyError> {
        if self.planned.iter().any(|r| r.collection == collection && &r.key == key) {
            return Ok(Some(PLANNED_ID));
        }
        Ok(self.store.find(collection, key)?.map(|doc| doc.id))
    }

    pub fn region(&self, name: &str) -> Result<DocumentId, ApplyError> {
        self.find_id(Collection::Regions, &NaturalKey::new([name]))?
            .ok_or_else(|| RecordError::missing("region", name).into())
    }

    /// Find a summit by name, narrowed to a region when one is given. A bare
    /// name that matches summits in several regions is ambiguous.
    pub fn summit(&self, name: &str, region: Option<&str>) -> Result<Document, ApplyError> {
        if let Some(region) = region {
            let region_id = self.region(region)?;
            let key = NaturalKey::new([name.to_string(), region_id.0.to_string()]);
            return self
                .store
                .find(Collection::Summits, &key)?
                .ok_or_else(|| RecordError::missing("summit", format!("{name} ({region})")).into());
        }

        let mut matches = self.store.find_by_field(Collection::Summits, "name", name)?;
        match matches.len() {
            0 => Err(RecordError::missing("summit", name).into()),
            1 => Ok(matches.remove(0)),
            n => Err(RecordError::AmbiguousReference {
                entity: "summit",
                reference: name.to_string(),
                matches: n,
            }
            .into()),
        }
    }

    pub fn route(&self, name: &str, summit: &Document) -> Result<DocumentId, ApplyError> {
        let key = NaturalKey::new([name.to_string(), summit.id.0.to_string()]);
        self.find_id(Collection::Routes, &key)?.ok_or_else(|| {
            let summit_name = summit.str_field("name").unwrap_or("?");
            RecordError::missing("route", format!("{name} @ {summit_name}")).into()
        })
    }

    pub fn climber(&self, full_name: &str) -> Result<DocumentId, ApplyError> {
        let (first, last) = split_full_name(full_name)
            .ok_or_else(|| RecordError::Shape(format!("climber '{full_name}' needs a first and last name")))?;
        self.find_id(Collection::Climbers, &NaturalKey::new([first, last]))?
            .ok_or_else(|| RecordError::missing("climber", full_name).into())
    }
}

// ---------------------------------------------------------------------------
// Per-kind resolution
// ---------------------------------------------------------------------------

pub fn resolve_record<S: EntityStore + ?Sized>(
    store: &S,
    collection: Collection,
    record: &Value,
) -> Result<Resolved, ApplyError> {
    resolve_with(&Lookup::new(store), collection, record)
}

/// Resolve against the store plus references that are not written yet.
pub fn resolve_with<S: EntityStore + ?Sized>(
    lookup: &Lookup<'_, S>,
    collection: Collection,
    record: &Value,
) -> Result<Resolved, ApplyError> {
    let obj = as_object(record)?;
    let fields = match collection {
        Collection::Regions => resolve_region(obj)?,
        Collection::Summits => resolve_summit(lookup, obj)?,
        Collection::Routes => resolve_route(lookup, obj)?,
        Collection::Climbers => resolve_climber(obj)?,
        Collection::Ascents => resolve_ascent(lookup, obj)?,
    };
    let key = natural_key(collection, &fields)?;
    Ok(Resolved { key, fields })
}

fn resolve_region(obj: &Map<String, Value>) -> Result<Map<String, Value>, RecordError> {
    required_str(obj, "name")?;
    Ok(body_of(obj))
}

fn resolve_summit<S: EntityStore + ?Sized>(
    lookup: &Lookup<'_, S>,
    obj: &Map<String, Value>,
) -> Result<Map<String, Value>, ApplyError> {
    required_str(obj, "name")?;
    let region = required_str(obj, "region")?;
    let position = GpsPosition::from_value(obj.get(POSITION_FIELD)).map_err(RecordError::Shape)?;
    let region_id = lookup.region(region)?;

    let mut fields = body_of(obj);
    fields.insert("region".into(), region_id.to_value());
    match position {
        Some(p) => fields.insert(POSITION_FIELD.into(), p.to_value()),
        None => fields.remove(POSITION_FIELD),
    };
    Ok(fields)
}

fn resolve_route<S: EntityStore + ?Sized>(
    lookup: &Lookup<'_, S>,
    obj: &Map<String, Value>,
) -> Result<Map<String, Value>, ApplyError> {
    required_str(obj, "name")?;
    let summit_name = required_str(obj, "summit")?;
    let region = optional_str(obj, "region")?;
    expect_kind(obj, "difficulty", "an object", Value::is_object)?;
    expect_kind(obj, "stars", "a number", Value::is_number)?;
    expect_kind(obj, "unsecure", "a boolean", Value::is_boolean)?;

    let summit = lookup.summit(summit_name, region)?;

    let mut fields = body_of(obj);
    fields.remove("region");
    fields.insert("summit".into(), summit.id.to_value());
    Ok(fields)
}

fn resolve_climber(obj: &Map<String, Value>) -> Result<Map<String, Value>, RecordError> {
    let mut fields = body_of(obj);
    if obj.contains_key("firstName") || obj.contains_key("lastName") {
        required_str(obj, "firstName")?;
        required_str(obj, "lastName")?;
        fields.remove("name");
        return Ok(fields);
    }

    let name = required_str(obj, "name")?;
    let (first, last) = split_full_name(name)
        .ok_or_else(|| RecordError::Shape(format!("climber '{name}' needs a first and last name")))?;
    fields.remove("name");
    fields.insert("firstName".into(), Value::from(first));
    fields.insert("lastName".into(), Value::from(last));
    Ok(fields)
}

fn resolve_ascent<S: EntityStore + ?Sized>(
    lookup: &Lookup<'_, S>,
    obj: &Map<String, Value>,
) -> Result<Map<String, Value>, ApplyError> {
    let date = required_str(obj, "date")?;
    NaiveDate::parse_from_str(date, DATE_FORMAT)
        .map_err(|_| RecordError::Shape(format!("'date' must be YYYY-MM-DD, got '{date}'")))?;
    let route_name = required_str(obj, "route")?;
    let summit_name = required_str(obj, "summit")?;
    let region = optional_str(obj, "region")?;
    for flag in ["topRope", "solo", "withoutSupport"] {
        expect_kind(obj, flag, "a boolean", Value::is_boolean)?;
    }
    expect_kind(obj, "notes", "a string", Value::is_string)?;

    let summit = lookup.summit(summit_name, region)?;
    let route_id = lookup.route(route_name, &summit)?;

    let climbers = match obj.get("climbers") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| resolve_climber_entry(lookup, entry))
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(RecordError::Shape(format!("'climbers' must be an array, got {other}")).into())
        }
    };

    let mut fields = body_of(obj);
    fields.remove("summit");
    fields.remove("region");
    fields.insert("route".into(), route_id.to_value());
    fields.insert("climbers".into(), Value::Array(climbers));
    match optional_str(obj, "leadClimber")? {
        Some(lead) => {
            let lead_id = lookup.climber(lead)?;
            fields.insert("leadClimber".into(), lead_id.to_value());
        }
        None => {
            fields.remove("leadClimber");
        }
    }
    Ok(fields)
}

/// `"Bernd Arnold"` or `{"climber": "Bernd Arnold", "isAborted": true}`.
fn resolve_climber_entry<S: EntityStore + ?Sized>(
    lookup: &Lookup<'_, S>,
    entry: &Value,
) -> Result<Value, ApplyError> {
    let (name, aborted) = match entry {
        Value::String(name) => (name.as_str(), false),
        Value::Object(obj) => {
            let name = required_str(obj, "climber")?;
            let aborted = match obj.get("isAborted") {
                None | Some(Value::Null) => false,
                Some(Value::Bool(b)) => *b,
                Some(other) => {
                    return Err(RecordError::Shape(format!("'isAborted' must be a boolean, got {other}")).into())
                }
            };
            (name, aborted)
        }
        other => return Err(RecordError::Shape(format!("climber entry must be a name or object, got {other}")).into()),
    };

    let id = lookup.climber(name)?;
    let mut out = Map::new();
    out.insert("climber".into(), id.to_value());
    out.insert("isAborted".into(), Value::Bool(aborted));
    Ok(Value::Object(out))
}
