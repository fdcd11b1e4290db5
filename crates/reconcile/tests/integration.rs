use std::cell::Cell;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use gipfelbuch_reconcile::config::{MissingReference, ReconcileConfig};
use gipfelbuch_reconcile::engine::{run, run_with_clock};
use gipfelbuch_reconcile::gps::{haversine_distance, GpsPosition};
use gipfelbuch_reconcile::load::load_input;
use gipfelbuch_reconcile::model::{OperationCounts, ReconcileInput, RunReport};
use gipfelbuch_reconcile::{MergeMode, ReconcileError};
use gipfelbuch_store::{
    Collection, Document, DocumentId, EntityStore, NaturalKey, SqliteStore, StoreError,
};
use serde_json::{json, Map, Value};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture_config() -> ReconcileConfig {
    let toml = std::fs::read_to_string(fixtures_dir().join("sandstein.toml")).unwrap();
    ReconcileConfig::from_toml(&toml).unwrap()
}

fn fixture_run(store: &mut SqliteStore) -> RunReport {
    let config = fixture_config();
    let input = load_input(&config, &fixtures_dir()).unwrap();
    run(&config, &input, store).unwrap()
}

fn config(mode: &str, collections: &str) -> ReconcileConfig {
    let mut sources = String::new();
    for name in ["regions", "summits", "gps", "routes", "climbers", "ascents"] {
        sources.push_str(&format!("[sources.{name}]\nfile = \"{name}.json\"\n\n"));
    }
    let toml = format!("name = \"test\"\nmode = \"{mode}\"\n\n{sources}[collections]\n{collections}\n");
    ReconcileConfig::from_toml(&toml).unwrap()
}

fn counts(report: &RunReport, collection: Collection) -> OperationCounts {
    report
        .collection(collection)
        .map(|c| c.totals)
        .unwrap_or_default()
}

fn find(store: &SqliteStore, collection: Collection, parts: &[&str]) -> Option<Document> {
    store.find(collection, &NaturalKey::new(parts.iter().copied())).unwrap()
}

fn summit(store: &SqliteStore, name: &str, region: &str) -> Document {
    let region = find(store, Collection::Regions, &[region]).expect("region");
    let key = NaturalKey::new([name.to_string(), region.id.0.to_string()]);
    store.find(Collection::Summits, &key).unwrap().expect("summit")
}

fn position(doc: &Document) -> Option<GpsPosition> {
    GpsPosition::from_value(doc.field("gpsPosition")).unwrap()
}

fn t(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
}

fn day_1() -> DateTime<Utc> {
    t(1)
}

fn day_2() -> DateTime<Utc> {
    t(2)
}

fn day_3() -> DateTime<Utc> {
    t(3)
}

// -------------------------------------------------------------------------
// Full fixture run
// -------------------------------------------------------------------------

#[test]
fn fixture_first_run() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let report = fixture_run(&mut store);

    assert_eq!(report.meta.config_name, "Sächsische Schweiz");
    assert_eq!(report.meta.mode, MergeMode::Update);
    let order: Vec<Collection> = report.collections.iter().map(|c| c.collection).collect();
    assert_eq!(order, Collection::ORDERED.to_vec());

    assert_eq!(counts(&report, Collection::Regions).inserted, 2);

    let summits = report.collection(Collection::Summits).unwrap();
    let names: Vec<&str> = summits.sources.iter().map(|s| s.source.as_str()).collect();
    assert_eq!(names, vec!["summits", "osm"], "GPS merge runs after ordinary sources");
    assert_eq!(summits.sources[0].counts.inserted, 3);
    let osm = summits.sources[1].counts;
    assert_eq!((osm.updated, osm.skipped, osm.failed), (1, 1, 1));

    let routes = counts(&report, Collection::Routes);
    assert_eq!((routes.inserted, routes.failed), (2, 1));
    assert_eq!(counts(&report, Collection::Climbers).inserted, 2);
    let ascents = counts(&report, Collection::Ascents);
    assert_eq!((ascents.inserted, ascents.failed), (1, 1));

    assert_eq!(report.totals.inserted, 10);
    assert_eq!(report.totals.updated, 1);
    assert_eq!(report.totals.skipped, 1);
    assert_eq!(report.totals.failed, 3);
    assert!(report.collections.iter().all(|c| c.changed));
}

#[test]
fn fixture_documents_hold_ids_not_names() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    fixture_run(&mut store);

    let bielatal = find(&store, Collection::Regions, &["Bielatal"]).unwrap();
    let lokomotive = summit(&store, "Lokomotive", "Bielatal");
    assert_eq!(lokomotive.field("region"), Some(&json!(bielatal.id.0)));

    let alter_weg = store
        .find(
            Collection::Routes,
            &NaturalKey::new(["Alter Weg".to_string(), lokomotive.id.0.to_string()]),
        )
        .unwrap()
        .unwrap();
    let arnold = find(&store, Collection::Climbers, &["Bernd", "Arnold"]).unwrap();
    let wiessner = find(&store, Collection::Climbers, &["Fritz", "Wiessner"]).unwrap();

    let ascent = store
        .find(
            Collection::Ascents,
            &NaturalKey::new([
                "2023-06-01".to_string(),
                alter_weg.id.0.to_string(),
                arnold.id.0.to_string(),
            ]),
        )
        .unwrap()
        .unwrap();
    assert_eq!(ascent.field("route"), Some(&json!(alter_weg.id.0)));
    assert_eq!(ascent.field("leadClimber"), Some(&json!(arnold.id.0)));
    assert_eq!(
        ascent.field("climbers"),
        Some(&json!([
            { "climber": arnold.id.0, "isAborted": false },
            { "climber": wiessner.id.0, "isAborted": true }
        ]))
    );
    assert!(ascent.field("summit").is_none());
}

#[test]
fn fixture_gps_merge_fills_and_gates() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    fixture_run(&mut store);

    // 500 m away from the stored position: rejected.
    let lokomotive = summit(&store, "Lokomotive", "Bielatal");
    assert_eq!(position(&lokomotive), Some(GpsPosition::new(50.9, 14.0)));

    // No stored position yet: filled from the GeoJSON [lng, lat] point.
    let moench = summit(&store, "Mönch", "Rathen");
    assert_eq!(position(&moench), Some(GpsPosition::new(50.9608, 14.0745)));
}

fn failures(report: &RunReport) -> Vec<(String, &'static str, String)> {
    report
        .collections
        .iter()
        .flat_map(|c| c.sources.iter())
        .flat_map(|s| s.failures.iter().map(move |f| (s.source.clone(), f.category, f.key.clone())))
        .collect()
}

#[test]
fn failures_carry_source_and_record_identity() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let report = fixture_run(&mut store);
    assert_eq!(
        failures(&report),
        vec![
            ("osm".to_string(), "missing_reference", "Nirgendwo".to_string()),
            ("routes".to_string(), "missing_reference", "Geisterweg @ Geisterturm".to_string()),
            ("ascents".to_string(), "missing_reference", "2023-06-02 Alter Weg @ Lokomotive".to_string()),
        ]
    );
}

// -------------------------------------------------------------------------
// Idempotence
// -------------------------------------------------------------------------

#[test]
fn second_update_run_writes_nothing() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    fixture_run(&mut store);
    let before: Vec<usize> = Collection::ORDERED.iter().map(|c| store.count(*c).unwrap()).collect();

    let report = fixture_run(&mut store);
    assert_eq!(report.totals.writes(), 0, "totals: {}", report.totals);
    assert_eq!(report.totals.skipped, 12);
    assert_eq!(report.totals.failed, 3, "bad records stay bad");
    assert!(report.collections.iter().all(|c| !c.changed));

    let after: Vec<usize> = Collection::ORDERED.iter().map(|c| store.count(*c).unwrap()).collect();
    assert_eq!(before, after);
}

// -------------------------------------------------------------------------
// Referential integrity
// -------------------------------------------------------------------------

#[test]
fn dangling_references_are_never_persisted() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let config = config(
        "update",
        r#"regions = ["regions"]
summits = ["summits"]
routes = ["routes"]
ascents = ["ascents"]"#,
    );
    let input = ReconcileInput::default()
        .with_source("regions", vec![json!({"name": "Bielatal"})])
        .with_source(
            "summits",
            vec![
                json!({"name": "Lokomotive", "region": "Bielatal"}),
                json!({"name": "Falkenstein", "region": "Schrammsteine"}),
            ],
        )
        .with_source("routes", vec![json!({"name": "Südriss", "summit": "Falkenstein"})])
        .with_source(
            "ascents",
            vec![json!({"date": "2023-07-01", "route": "Südriss", "summit": "Lokomotive"})],
        );

    let report = run(&config, &input, &mut store).unwrap();
    assert_eq!(counts(&report, Collection::Summits).failed, 1);
    assert_eq!(counts(&report, Collection::Routes).failed, 1);
    assert_eq!(counts(&report, Collection::Ascents).failed, 1);

    assert_eq!(store.count(Collection::Regions).unwrap(), 1, "missing region not created by default");
    assert_eq!(store.count(Collection::Summits).unwrap(), 1);
    assert_eq!(store.count(Collection::Routes).unwrap(), 0);
    assert_eq!(store.count(Collection::Ascents).unwrap(), 0);
    assert!(!report.collection(Collection::Routes).unwrap().changed);
}

#[test]
fn create_policy_inserts_missing_region_and_reports_it() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let toml = r#"
name = "create"

[references]
region = "create"

[sources.summits]
file = "summits.json"

[collections]
summits = ["summits"]
"#;
    let config = ReconcileConfig::from_toml(toml).unwrap();
    let input = ReconcileInput::default().with_source(
        "summits",
        vec![
            json!({"name": "Falkenstein", "region": "Schrammsteine"}),
            json!({"name": "Schrammtorwächter", "region": "Schrammsteine"}),
        ],
    );

    let report = run(&config, &input, &mut store).unwrap();
    assert_eq!(counts(&report, Collection::Summits).inserted, 2);
    assert_eq!(report.collection(Collection::Summits).unwrap().sources[0].created_references, 1);

    let regions = report.collection(Collection::Regions).expect("created regions are reported");
    assert_eq!(regions.created_by_reference, 1);
    assert!(regions.changed);
    assert!(store.last_change(Collection::Regions).unwrap().is_some());
    assert_eq!(store.count(Collection::Regions).unwrap(), 1);
}

#[test]
fn rejected_ascent_creates_no_climbers() {
    let mut store = store_with_route(2);
    let mut config = config("update", r#"ascents = ["ascents"]"#);
    config.references.climber = MissingReference::Create;
    let input = ReconcileInput::default().with_source(
        "ascents",
        vec![
            json!({"date": "2023-06-01", "route": "Alter Weg", "summit": "Lokomotive", "climbers": ["Bernd Arnold", 42]}),
            json!({
                "date": "2023-06-02",
                "route": "Alter Weg",
                "summit": "Lokomotive",
                "climbers": ["Bernd Arnold", "Fritz Wiessner"],
                "leadClimber": "Bernd Arnold",
            }),
        ],
    );

    let report = run(&config, &input, &mut store).unwrap();
    let ascents = report.collection(Collection::Ascents).unwrap();
    assert_eq!((ascents.totals.inserted, ascents.totals.failed), (1, 1));
    assert_eq!(ascents.sources[0].failures[0].index, 0);
    assert_eq!(ascents.sources[0].failures[0].category, "shape");

    // Only the valid ascent's climbers exist, each once.
    assert_eq!(ascents.sources[0].created_references, 2);
    assert_eq!(store.count(Collection::Climbers).unwrap(), 2);
    assert!(find(&store, Collection::Climbers, &["Fritz", "Wiessner"]).is_some());
}

#[test]
fn missing_source_data_stops_the_run_before_any_write() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let config = config("update", r#"regions = ["regions"]
summits = ["summits"]"#);
    let input = ReconcileInput::default().with_source("regions", vec![json!({"name": "Bielatal"})]);

    let err = run(&config, &input, &mut store).unwrap_err();
    match err {
        ReconcileError::UnknownSource { collection, source } => {
            assert_eq!(collection, Collection::Summits);
            assert_eq!(source, "summits");
        }
        other => panic!("expected unknown source, got {other}"),
    }
    assert_eq!(store.count(Collection::Regions).unwrap(), 0);
    assert!(store.last_change(Collection::Regions).unwrap().is_none());
}

// -------------------------------------------------------------------------
// Distance gate
// -------------------------------------------------------------------------

fn gps_run(store: &mut SqliteStore, change_threshold: f64, candidate: GpsPosition) -> OperationCounts {
    let mut config = config("update", r#"summits = [{ type = "gpsLocation", dependency = "gps" }]"#);
    config.gps.change_distance_threshold = change_threshold;
    config.gps.log_distance_threshold = 0.0;
    let input = ReconcileInput::default()
        .with_source("gps", vec![json!({"name": "Lokomotive", "gpsPosition": candidate.to_value()})]);
    counts(&run(&config, &input, store).unwrap(), Collection::Summits)
}

fn store_with_positioned_summit() -> SqliteStore {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let config = config("update", r#"regions = ["regions"]
summits = ["summits"]"#);
    let input = ReconcileInput::default()
        .with_source("regions", vec![json!({"name": "Bielatal"})])
        .with_source(
            "summits",
            vec![json!({"name": "Lokomotive", "region": "Bielatal", "gpsPosition": {"lat": 50.9, "lng": 14.0}})],
        );
    run(&config, &input, &mut store).unwrap();
    store
}

#[test]
fn gps_update_exactly_at_threshold_is_accepted() {
    let mut store = store_with_positioned_summit();
    let existing = GpsPosition::new(50.9, 14.0);
    // Roughly 100 m north; the threshold is the computed distance itself.
    let candidate = GpsPosition::new(50.9 + 100.0 / 111_195.0, 14.0);
    let threshold = haversine_distance(existing, candidate);
    assert!((threshold - 100.0).abs() < 0.1);

    let c = gps_run(&mut store, threshold, candidate);
    assert_eq!(c.updated, 1);
    assert_eq!(position(&summit(&store, "Lokomotive", "Bielatal")), Some(candidate));
}

#[test]
fn gps_update_beyond_threshold_keeps_original() {
    let mut store = store_with_positioned_summit();
    let candidate = GpsPosition::new(50.9 + 150.0 / 111_195.0, 14.0);

    let c = gps_run(&mut store, 100.0, candidate);
    assert_eq!((c.updated, c.skipped), (0, 1));
    assert_eq!(
        position(&summit(&store, "Lokomotive", "Bielatal")),
        Some(GpsPosition::new(50.9, 14.0))
    );
}

// -------------------------------------------------------------------------
// Mode semantics
// -------------------------------------------------------------------------

#[test]
fn insert_mode_never_overwrites_a_stored_position() {
    let mut store = store_with_positioned_summit();
    let config = config("insert", r#"summits = ["summits", { type = "gpsLocation", dependency = "gps" }]"#);
    let moved = json!({"lat": 50.9002, "lng": 14.0});
    let input = ReconcileInput::default()
        .with_source(
            "summits",
            vec![json!({"name": "Lokomotive", "region": "Bielatal", "gpsPosition": moved})],
        )
        .with_source("gps", vec![json!({"name": "Lokomotive", "gpsPosition": moved})]);

    let report = run(&config, &input, &mut store).unwrap();
    assert_eq!(counts(&report, Collection::Summits).skipped, 2);
    assert_eq!(
        position(&summit(&store, "Lokomotive", "Bielatal")),
        Some(GpsPosition::new(50.9, 14.0))
    );
}

fn store_with_route(stars: u64) -> SqliteStore {
    let mut store = store_with_positioned_summit();
    let config = config("update", r#"routes = ["routes"]"#);
    let input = ReconcileInput::default().with_source(
        "routes",
        vec![json!({"name": "Alter Weg", "summit": "Lokomotive", "stars": stars, "unsecure": true})],
    );
    run(&config, &input, &mut store).unwrap();
    store
}

fn alter_weg(store: &SqliteStore) -> Document {
    let lokomotive = summit(store, "Lokomotive", "Bielatal");
    store
        .find(
            Collection::Routes,
            &NaturalKey::new(["Alter Weg".to_string(), lokomotive.id.0.to_string()]),
        )
        .unwrap()
        .unwrap()
}

#[test]
fn replace_mode_drops_fields_missing_from_candidate() {
    let mut store = store_with_route(2);
    let config = config("replace", r#"routes = ["routes"]"#);
    let input = ReconcileInput::default()
        .with_source("routes", vec![json!({"name": "Alter Weg", "summit": "Lokomotive"})]);

    let report = run(&config, &input, &mut store).unwrap();
    assert_eq!(counts(&report, Collection::Routes).replaced, 1);
    let route = alter_weg(&store);
    assert!(route.field("stars").is_none());
    assert!(route.field("unsecure").is_none());
    assert_eq!(route.version, 1);
}

#[test]
fn replace_mode_with_only_a_rejected_position_writes_nothing() {
    let mut store = store_with_positioned_summit();
    let config = config("replace", r#"summits = ["summits"]"#);
    // About 5.5 km north of the stored position.
    let input = ReconcileInput::default().with_source(
        "summits",
        vec![json!({"name": "Lokomotive", "region": "Bielatal", "gpsPosition": {"lat": 50.95, "lng": 14.0}})],
    );
    let before = store.last_change(Collection::Summits).unwrap();

    let report = run_with_clock(&config, &input, &mut store, day_3).unwrap();
    let summits = report.collection(Collection::Summits).unwrap();
    assert_eq!((summits.totals.replaced, summits.totals.skipped), (0, 1));
    assert!(!summits.changed);

    let lokomotive = summit(&store, "Lokomotive", "Bielatal");
    assert_eq!(lokomotive.version, 0);
    assert_eq!(position(&lokomotive), Some(GpsPosition::new(50.9, 14.0)));
    assert_eq!(store.last_change(Collection::Summits).unwrap(), before);
}

#[test]
fn update_mode_keeps_unmentioned_fields() {
    let mut store = store_with_route(2);
    let config = config("update", r#"routes = ["routes"]"#);

    let unchanged = ReconcileInput::default()
        .with_source("routes", vec![json!({"name": "Alter Weg", "summit": "Lokomotive", "stars": 2})]);
    let report = run(&config, &unchanged, &mut store).unwrap();
    assert_eq!(counts(&report, Collection::Routes).skipped, 1);

    let changed = ReconcileInput::default()
        .with_source("routes", vec![json!({"name": "Alter Weg", "summit": "Lokomotive", "stars": 3})]);
    let report = run(&config, &changed, &mut store).unwrap();
    assert_eq!(counts(&report, Collection::Routes).updated, 1);

    let route = alter_weg(&store);
    assert_eq!(route.field("stars"), Some(&json!(3)));
    assert_eq!(route.field("unsecure"), Some(&json!(true)));
}

// -------------------------------------------------------------------------
// Uniqueness
// -------------------------------------------------------------------------

#[test]
fn same_summit_twice_is_one_document() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let config = config("update", r#"regions = ["regions"]
summits = ["summits"]"#);
    let lokomotive = json!({"name": "Lokomotive", "region": "Bielatal"});
    let input = ReconcileInput::default()
        .with_source("regions", vec![json!({"name": "Bielatal"})])
        .with_source("summits", vec![lokomotive.clone(), lokomotive]);

    let report = run(&config, &input, &mut store).unwrap();
    let c = counts(&report, Collection::Summits);
    assert_eq!((c.inserted, c.skipped), (1, 1));

    run(&config, &input, &mut store).unwrap();
    assert_eq!(store.count(Collection::Summits).unwrap(), 1);
}

// -------------------------------------------------------------------------
// LastChange
// -------------------------------------------------------------------------

#[test]
fn last_change_advances_only_on_writes() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let config = config("update", r#"regions = ["regions"]"#);
    let one = ReconcileInput::default().with_source("regions", vec![json!({"name": "Bielatal"})]);

    run_with_clock(&config, &one, &mut store, day_1).unwrap();
    assert_eq!(store.last_change(Collection::Regions).unwrap(), Some(t(1)));

    let report = run_with_clock(&config, &one, &mut store, day_2).unwrap();
    let regions = report.collection(Collection::Regions).unwrap();
    assert!(!regions.changed);
    assert_eq!(regions.last_modified, Some(t(1)));
    assert_eq!(store.last_change(Collection::Regions).unwrap(), Some(t(1)));

    // Failures alone do not count as a change either.
    let broken = ReconcileInput::default().with_source("regions", vec![json!({"name": 7})]);
    run_with_clock(&config, &broken, &mut store, day_2).unwrap();
    assert_eq!(store.last_change(Collection::Regions).unwrap(), Some(t(1)));

    let two = ReconcileInput::default()
        .with_source("regions", vec![json!({"name": "Bielatal"}), json!({"name": "Rathen"})]);
    run_with_clock(&config, &two, &mut store, day_3).unwrap();
    assert_eq!(store.last_change(Collection::Regions).unwrap(), Some(t(3)));

    // A writer with a lagging clock never moves it backwards.
    let three = ReconcileInput::default().with_source("regions", vec![json!({"name": "Gohrisch"})]);
    let report = run_with_clock(&config, &three, &mut store, day_2).unwrap();
    assert_eq!(report.collection(Collection::Regions).unwrap().last_modified, Some(t(3)));
}

// -------------------------------------------------------------------------
// End-to-end GPS scenario
// -------------------------------------------------------------------------

#[test]
fn gps_insert_mode_fills_missing_position_once() {
    let mut store = SqliteStore::open_in_memory().unwrap();
    let seed = config("update", r#"regions = ["regions"]
summits = ["summits"]"#);
    let input = ReconcileInput::default()
        .with_source("regions", vec![json!({"name": "Bielatal"})])
        .with_source("summits", vec![json!({"name": "Lokomotive", "region": "Bielatal"})]);
    run(&seed, &input, &mut store).unwrap();
    assert_eq!(position(&summit(&store, "Lokomotive", "Bielatal")), None);

    let config = config("insert", r#"summits = [{ type = "gpsLocation", dependency = "gps" }]"#);
    let gps = ReconcileInput::default().with_source(
        "gps",
        vec![json!({"name": "Lokomotive", "gpsPosition": {"lat": 50.91, "lng": 14.02}})],
    );

    let first = counts(&run(&config, &gps, &mut store).unwrap(), Collection::Summits);
    assert_eq!((first.updated, first.skipped), (1, 0));
    assert_eq!(
        position(&summit(&store, "Lokomotive", "Bielatal")),
        Some(GpsPosition::new(50.91, 14.02))
    );

    let second = counts(&run(&config, &gps, &mut store).unwrap(), Collection::Summits);
    assert_eq!((second.updated, second.skipped), (0, 1));
}

// -------------------------------------------------------------------------
// Store failures
// -------------------------------------------------------------------------

/// Delegates to SQLite, failing writes for one summit name and going dark
/// after a number of inserts.
struct FlakyStore {
    inner: SqliteStore,
    reject_summit: Option<&'static str>,
    inserts_before_outage: Option<usize>,
    inserts: Cell<usize>,
}

impl FlakyStore {
    fn new(inner: SqliteStore) -> Self {
        Self { inner, reject_summit: None, inserts_before_outage: None, inserts: Cell::new(0) }
    }

    fn down(&self) -> bool {
        self.inserts_before_outage.is_some_and(|n| self.inserts.get() >= n)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down() {
            Err(StoreError::Unavailable("connection reset".into()))
        } else {
            Ok(())
        }
    }
}

impl EntityStore for FlakyStore {
    fn ping(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.ping()
    }

    fn find(&self, collection: Collection, key: &NaturalKey) -> Result<Option<Document>, StoreError> {
        self.check()?;
        self.inner.find(collection, key)
    }

    fn find_by_field(&self, collection: Collection, field: &str, value: &str) -> Result<Vec<Document>, StoreError> {
        self.check()?;
        self.inner.find_by_field(collection, field, value)
    }

    fn get(&self, collection: Collection, id: DocumentId) -> Result<Option<Document>, StoreError> {
        self.check()?;
        self.inner.get(collection, id)
    }

    fn insert(&mut self, collection: Collection, key: &NaturalKey, fields: &Map<String, Value>) -> Result<DocumentId, StoreError> {
        self.check()?;
        if collection == Collection::Summits
            && self.reject_summit.is_some_and(|name| fields.get("name") == Some(&json!(name)))
        {
            return Err(StoreError::Query("disk quota exceeded".into()));
        }
        let id = self.inner.insert(collection, key, fields)?;
        self.inserts.set(self.inserts.get() + 1);
        Ok(id)
    }

    fn replace(&mut self, collection: Collection, id: DocumentId, key: &NaturalKey, fields: &Map<String, Value>) -> Result<(), StoreError> {
        self.check()?;
        self.inner.replace(collection, id, key, fields)
    }

    fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        self.inner.count(collection)
    }

    fn last_change(&self, collection: Collection) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.check()?;
        self.inner.last_change(collection)
    }

    fn touch_last_change(&mut self, collection: Collection, at: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        self.check()?;
        self.inner.touch_last_change(collection, at)
    }
}

fn three_summits() -> (ReconcileConfig, ReconcileInput) {
    let config = config("update", r#"regions = ["regions"]
summits = ["summits"]"#);
    let input = ReconcileInput::default()
        .with_source("regions", vec![json!({"name": "Rathen"})])
        .with_source(
            "summits",
            vec![
                json!({"name": "Mönch", "region": "Rathen"}),
                json!({"name": "Lokomotive", "region": "Rathen"}),
                json!({"name": "Talwächter", "region": "Rathen"}),
            ],
        );
    (config, input)
}

#[test]
fn persistence_error_fails_one_record_and_continues() {
    let mut store = FlakyStore::new(SqliteStore::open_in_memory().unwrap());
    store.reject_summit = Some("Lokomotive");
    let (config, input) = three_summits();

    let report = run(&config, &input, &mut store).unwrap();
    let summits = report.collection(Collection::Summits).unwrap();
    assert_eq!((summits.totals.inserted, summits.totals.failed), (2, 1));
    assert_eq!(summits.sources[0].failures[0].category, "persistence");
    assert_eq!(summits.sources[0].failures[0].index, 1);
    assert_eq!(store.count(Collection::Summits).unwrap(), 2);
}

#[test]
fn unreachable_store_aborts_and_keeps_earlier_writes() {
    let mut store = FlakyStore::new(SqliteStore::open_in_memory().unwrap());
    // The region and the first summit go through, then the connection drops.
    store.inserts_before_outage = Some(2);
    let (config, input) = three_summits();

    let err = run(&config, &input, &mut store).unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Unavailable(_))), "got: {err}");

    assert_eq!(store.count(Collection::Regions).unwrap(), 1);
    assert_eq!(store.count(Collection::Summits).unwrap(), 1);
    assert!(store.inner.last_change(Collection::Regions).unwrap().is_some());
    assert!(store.inner.last_change(Collection::Summits).unwrap().is_none());
}

#[test]
fn created_references_are_tracked_even_if_a_later_collection_fails() {
    let mut store = FlakyStore::new(SqliteStore::open_in_memory().unwrap());
    // One created region and two summits go through; the outage hits mid-routes.
    store.inserts_before_outage = Some(4);
    let toml = r#"
name = "outage"

[references]
region = "create"

[sources.summits]
file = "summits.json"

[sources.routes]
file = "routes.json"

[collections]
summits = ["summits"]
routes = ["routes"]
"#;
    let config = ReconcileConfig::from_toml(toml).unwrap();
    let input = ReconcileInput::default()
        .with_source(
            "summits",
            vec![
                json!({"name": "Falkenstein", "region": "Schrammsteine"}),
                json!({"name": "Schrammtorwächter", "region": "Schrammsteine"}),
            ],
        )
        .with_source(
            "routes",
            vec![
                json!({"name": "Südriss", "summit": "Falkenstein"}),
                json!({"name": "Nordweg", "summit": "Falkenstein"}),
            ],
        );

    let err = run_with_clock(&config, &input, &mut store, day_1).unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Unavailable(_))), "got: {err}");

    assert_eq!(store.count(Collection::Regions).unwrap(), 1);
    assert_eq!(store.count(Collection::Routes).unwrap(), 1);
    assert_eq!(store.inner.last_change(Collection::Regions).unwrap(), Some(t(1)));
    assert_eq!(store.inner.last_change(Collection::Summits).unwrap(), Some(t(1)));
    assert!(store.inner.last_change(Collection::Routes).unwrap().is_none());
}
