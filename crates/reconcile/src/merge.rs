//! Per-record merge: resolve, match by natural key, then insert, replace,
//! update or skip according to the configured mode.

use std::collections::BTreeMap;

use gipfelbuch_store::{Collection, Document, EntityStore};
use serde_json::{Map, Value};

use crate::config::{MergeMode, MissingReference, ReferencePolicy};
use crate::detect::detect_changes;
use crate::error::{ApplyError, RecordError};
use crate::gps::{GpsDecision, GpsMergePolicy, GpsPosition, POSITION_FIELD};
use crate::model::Outcome;
use crate::resolve::{self, Lookup, NewReference, Resolved};

pub struct MergeExecutor<'s, S: EntityStore + ?Sized> {
    store: &'s mut S,
    mode: MergeMode,
    gps: GpsMergePolicy,
    references: ReferencePolicy,
    created: BTreeMap<Collection, usize>,
}

impl<'s, S: EntityStore + ?Sized> MergeExecutor<'s, S> {
    pub fn new(store: &'s mut S, mode: MergeMode, gps: GpsMergePolicy, references: ReferencePolicy) -> Self {
        Self {
            store,
            mode,
            gps,
            references,
            created: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    pub fn store(&mut self) -> &mut S {
        self.store
    }

    /// Referenced documents created since the last call, per collection.
    pub fn take_created(&mut self) -> BTreeMap<Collection, usize> {
        std::mem::take(&mut self.created)
    }

    /// Apply one ordinary record to `collection`.
    pub fn apply(&mut self, collection: Collection, record: &Value, label: &str) -> Result<Outcome, ApplyError> {
        let resolved = self.resolve_creating_missing(collection, record, label)?;
        let existing = self.store.find(collection, &resolved.key)?;

        let outcome = match (self.mode, existing) {
            (_, None) => {
                self.store.insert(collection, &resolved.key, &resolved.fields)?;
                Outcome::Inserted
            }
            (MergeMode::Insert, Some(_)) => Outcome::Skipped,
            (MergeMode::Replace, Some(doc)) => {
                let (fields, position_rejected) = self.replacement_fields(collection, &doc, resolved.fields, label);
                // A rejected position was the only difference: keep the stored document.
                if position_rejected && !detect_changes(&doc.fields, &fields).has_changes() {
                    Outcome::Skipped
                } else {
                    self.store.replace(collection, doc.id, &resolved.key, &fields)?;
                    Outcome::Replaced
                }
            }
            (MergeMode::Update, Some(doc)) => {
                let merged = self.merged_fields(collection, &doc, &resolved.fields, label);
                let changes = detect_changes(&doc.fields, &merged);
                if !changes.has_changes() {
                    Outcome::Skipped
                } else {
                    log::debug!(
                        "{} '{label}': changed {}",
                        collection.entity_name(),
                        changes.fields().join(", ")
                    );
                    for change in &changes.changes {
                        log::trace!("  {}: {:?} -> {:?}", change.field, change.before, change.after);
                    }
                    self.store.replace(collection, doc.id, &resolved.key, &merged)?;
                    Outcome::Updated
                }
            }
        };
        Ok(outcome)
    }

    /// Merge only the position of an existing summit.
    ///
    /// In insert mode a stored position is never overwritten; otherwise the
    /// distance gate decides.
    pub fn apply_gps(&mut self, record: &Value, label: &str) -> Result<Outcome, ApplyError> {
        let obj = record
            .as_object()
            .ok_or_else(|| RecordError::Shape(format!("expected an object, got {record}")))?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| RecordError::Shape("missing 'name'".into()))?;
        let region = resolve::optional_str(obj, "region")?;
        let candidate = GpsPosition::from_value(obj.get(POSITION_FIELD))
            .map_err(RecordError::Shape)?
            .ok_or_else(|| RecordError::Shape("missing or incomplete 'gpsPosition'".into()))?;

        let summit = Lookup::new(&*self.store).summit(name, region)?;
        let existing = stored_position(&summit, label);

        let write = match self.mode {
            MergeMode::Insert => existing.is_none(),
            MergeMode::Replace | MergeMode::Update => self.gps.decide(label, existing, candidate).accepted(),
        };
        if !write {
            return Ok(Outcome::Skipped);
        }

        let key = resolve::natural_key(Collection::Summits, &summit.fields)?;
        let mut fields = summit.fields;
        fields.insert(POSITION_FIELD.into(), candidate.to_value());
        self.store.replace(Collection::Summits, summit.id, &key, &fields)?;
        Ok(Outcome::Updated)
    }

    /// Resolve, creating missing regions/climbers when the policy allows it.
    ///
    /// Missing references are only planned while the record is checked; they
    /// are written once the whole record resolves, so a rejected record
    /// leaves nothing behind.
    fn resolve_creating_missing(
        &mut self,
        collection: Collection,
        record: &Value,
        label: &str,
    ) -> Result<Resolved, ApplyError> {
        let mut planned: Vec<NewReference> = Vec::new();
        let resolved = loop {
            let attempt = resolve::resolve_with(&Lookup::with_planned(&*self.store, &planned), collection, record);
            match attempt {
                Err(ApplyError::Record(RecordError::MissingReference { entity, reference }))
                    if self.may_create(entity) =>
                {
                    match NewReference::for_missing(entity, &reference) {
                        Some(new) if !planned.contains(&new) => planned.push(new),
                        _ => return Err(RecordError::missing(entity, reference).into()),
                    }
                }
                other => break other?,
            }
        };
        if planned.is_empty() {
            return Ok(resolved);
        }

        for new in &planned {
            self.store.insert(new.collection, &new.key, &new.fields)?;
            log::info!(
                "{} '{label}': created missing {} '{}'",
                collection.entity_name(),
                new.entity,
                new.name
            );
            *self.created.entry(new.collection).or_insert(0) += 1;
        }
        resolve::resolve_record(&*self.store, collection, record)
    }

    fn may_create(&self, entity: &str) -> bool {
        let policy = match entity {
            "region" => self.references.region,
            "climber" => self.references.climber,
            _ => MissingReference::Reject,
        };
        policy == MissingReference::Create
    }

    /// Existing body overlaid with the candidate's fields. Fields the
    /// candidate does not mention keep their stored values.
    fn merged_fields(
        &self,
        collection: Collection,
        existing: &Document,
        candidate: &Map<String, Value>,
        label: &str,
    ) -> Map<String, Value> {
        let mut merged = existing.fields.clone();
        for (field, value) in candidate {
            if field != POSITION_FIELD {
                merged.insert(field.clone(), value.clone());
            }
        }
        if collection == Collection::Summits {
            if let Some(position) = self.gated_position(existing, candidate, label).position {
                merged.insert(POSITION_FIELD.into(), position);
            }
        }
        merged
    }

    /// The candidate wholesale, except that a stored summit position survives
    /// unless the candidate's position passes the distance gate. The flag is
    /// set when the gate rejected the candidate's position.
    fn replacement_fields(
        &self,
        collection: Collection,
        existing: &Document,
        mut candidate: Map<String, Value>,
        label: &str,
    ) -> (Map<String, Value>, bool) {
        if collection != Collection::Summits {
            return (candidate, false);
        }
        let gated = self.gated_position(existing, &candidate, label);
        match gated.position {
            Some(position) => candidate.insert(POSITION_FIELD.into(), position),
            None => candidate.remove(POSITION_FIELD),
        };
        (candidate, gated.rejected)
    }

    /// Position to store after merging `candidate` into `existing`.
    fn gated_position(
        &self,
        existing: &Document,
        candidate: &Map<String, Value>,
        label: &str,
    ) -> GatedPosition {
        let stored = stored_position(existing, label);
        // Candidate positions were validated during resolution.
        let incoming = GpsPosition::from_value(candidate.get(POSITION_FIELD)).ok().flatten();

        let keep = |rejected| GatedPosition { position: stored.map(GpsPosition::to_value), rejected };
        match (stored, incoming) {
            (_, None) => keep(false),
            (None, Some(new)) => GatedPosition { position: Some(new.to_value()), rejected: false },
            (Some(old), Some(new)) => match self.gps.decide(label, Some(old), new) {
                GpsDecision::Accept { .. } | GpsDecision::Corrected { .. } => {
                    GatedPosition { position: Some(new.to_value()), rejected: false }
                }
                GpsDecision::Unchanged => keep(false),
                GpsDecision::Reject { .. } => keep(true),
            },
        }
    }
}

/// Outcome of the distance gate for one summit. `position` is `None` if
/// neither side has one.
struct GatedPosition {
    position: Option<Value>,
    rejected: bool,
}

/// A stored position that cannot be read counts as no position.
fn stored_position(doc: &Document, label: &str) -> Option<GpsPosition> {
    match GpsPosition::from_value(doc.field(POSITION_FIELD)) {
        Ok(position) => position,
        Err(reason) => {
            log::warn!("summit '{label}': ignoring stored position ({reason})");
            None
        }
    }
}
