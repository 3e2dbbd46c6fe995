//! End-to-end archive scenarios across ingest, grouping, reconciliation,
//! sidecar sync, and tier movement.

use image::{ImageBuffer, Rgb};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use walkdir::WalkDir;

use photark::config::Config;
use photark::identity::ExactFingerprint;
use photark::ingest::{IngestOptions, IngestOutcome, Ingestor};
use photark::reconcile::{FieldValue, MetadataSet};
use photark::sidecar::{self, RegionArea, SidecarRegion};
use photark::similarity::SimilarityIndex;
use photark::store::Database;
use photark::sync::{SyncOutcome, Synchronizer};
use photark::tier::{Tier, TierManager, TierRoots};

struct Archive {
    db: Arc<Database>,
    ingestor: Ingestor,
    sync: Arc<Synchronizer>,
    manager: TierManager,
    hot: TempDir,
    _dirs: Vec<TempDir>,
}

fn archive() -> Archive {
    let hot = tempfile::tempdir().unwrap();
    let warm = tempfile::tempdir().unwrap();
    let cold = tempfile::tempdir().unwrap();
    let roots = TierRoots::new(
        hot.path().to_path_buf(),
        warm.path().to_path_buf(),
        cold.path().to_path_buf(),
    );

    let db = Arc::new(Database::open_in_memory().unwrap());
    db.initialize().unwrap();

    let config = Config::default();
    let policy = config.reconcile_policy();
    let index = Arc::new(SimilarityIndex::new());
    let sync = Arc::new(Synchronizer::new(db.clone(), policy.clone(), roots.clone()));
    let ingestor = Ingestor::new(
        db.clone(),
        index,
        sync.clone(),
        policy,
        roots.clone(),
        IngestOptions::from_config(&config),
    );
    let manager = TierManager::new(db.clone(), roots, config.tier_policy());

    Archive { db, ingestor, sync, manager, hot, _dirs: vec![warm, cold] }
}

fn scene() -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    ImageBuffer::from_fn(160, 120, |x, y| {
        Rgb([(x % 256) as u8, (y * 2 % 256) as u8, ((x + y) % 256) as u8])
    })
}

fn media_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) != Some("json"))
        .map(|e| e.into_path())
        .collect()
}

fn stored(outcome: IngestOutcome) -> i64 {
    match outcome {
        IngestOutcome::Stored { record_id } => record_id,
        other => panic!("expected Stored, got {other:?}"),
    }
}

#[test]
fn duplicate_and_derivative_flow() {
    let a = archive();
    let inbox = tempfile::tempdir().unwrap();

    let original = inbox.path().join("IMG_0100.png");
    scene().save(&original).unwrap();

    let id = stored(a.ingestor.ingest_file(&original, "icloud").unwrap());

    // Same bytes presented again by another tool.
    let renamed = inbox.path().join("beach-trip.png");
    std::fs::copy(&original, &renamed).unwrap();
    assert_eq!(
        a.ingestor.ingest_file(&renamed, "digikam").unwrap(),
        IngestOutcome::Duplicate { record_id: id }
    );

    // A lossy re-encode is a new payload in the same derivative family.
    let derived = inbox.path().join("IMG_0100.jpg");
    image::open(&original).unwrap().save(&derived).unwrap();
    let derived_id = stored(a.ingestor.ingest_file(&derived, "immich").unwrap());

    let record = a.db.record_by_id(id).unwrap();
    let sibling = a.db.record_by_id(derived_id).unwrap();
    assert_ne!(record.exact_fingerprint, sibling.exact_fingerprint);
    assert_eq!(record.group_id, sibling.group_id);

    assert_eq!(a.db.source_tags(id).unwrap(), vec!["digikam", "icloud"]);
    assert_eq!(a.db.source_tags(derived_id).unwrap(), vec!["immich"]);

    // Two payloads on disk, each read-only, each shadowed by a sidecar.
    let files = media_files(a.hot.path());
    assert_eq!(files.len(), 2);
    for file in &files {
        assert!(file.metadata().unwrap().permissions().readonly());
        assert!(sidecar::sidecar_path(file).exists());
    }
}

#[test]
fn field_policies_resolve_source_conflicts() {
    let a = archive();
    let inbox = tempfile::tempdir().unwrap();
    let original = inbox.path().join("IMG_0200.png");
    scene().save(&original).unwrap();
    let id = stored(a.ingestor.ingest_file(&original, "icloud").unwrap());

    let group = a.db.record_by_id(id).unwrap().group_id.unwrap();
    let policy = Config::default().reconcile_policy();

    let mut icloud = MetadataSet::new();
    icloud.insert(
        "gps.timestamp".to_string(),
        FieldValue::new("2024-03-15T09:29:58Z", "icloud"),
    );
    icloud.insert(
        "processing.hdr_gain".to_string(),
        FieldValue::new("1.2", "icloud"),
    );
    icloud.insert(
        "keywords".to_string(),
        FieldValue::new(r#"["beach","family"]"#, "icloud"),
    );
    a.db.merge_into_group(group, &icloud, &policy).unwrap();

    let mut immich = MetadataSet::new();
    immich.insert(
        "gps.timestamp".to_string(),
        FieldValue::new("2024-03-15T09:30:11Z", "immich"),
    );
    immich.insert(
        "processing.hdr_gain".to_string(),
        FieldValue::new("0.8", "immich"),
    );
    immich.insert(
        "keywords".to_string(),
        FieldValue::new(r#"["beach","sunset"]"#, "immich"),
    );
    a.db.merge_into_group(group, &immich, &policy).unwrap();

    let fields = a.db.merged_fields(id).unwrap();
    // gps.timestamp prefers the configured source.
    assert_eq!(fields["gps.timestamp"].value, "2024-03-15T09:29:58Z");
    assert_eq!(fields["gps.timestamp"].source, "icloud");
    // processing values stay side by side under tagged keys.
    assert_eq!(fields["processing.hdr_gain[icloud]"].value, "1.2");
    assert_eq!(fields["processing.hdr_gain[immich]"].value, "0.8");
    // keywords union.
    assert_eq!(fields["keywords"].value, r#"["beach","family","sunset"]"#);

    // The re-rendered sidecar carries the merged view.
    let record = a.db.record_by_id(id).unwrap();
    let path = a.sync.write_sidecar(&record).unwrap();
    let doc = sidecar::load_document(&path).unwrap();
    assert_eq!(doc.keywords, vec!["beach", "family", "sunset"]);
    assert_eq!(doc.fields["gps.timestamp"].source, "icloud");
}

#[test]
fn sidecar_edit_round_trip_and_person_propagation() {
    let a = archive();
    let inbox = tempfile::tempdir().unwrap();

    let original = inbox.path().join("pair-a.png");
    scene().save(&original).unwrap();
    let derived = inbox.path().join("pair-b.jpg");
    image::open(&original).unwrap().save(&derived).unwrap();

    let id_a = stored(a.ingestor.ingest_file(&original, "icloud").unwrap());
    let id_b = stored(a.ingestor.ingest_file(&derived, "immich").unwrap());
    assert_eq!(
        a.db.record_by_id(id_a).unwrap().group_id,
        a.db.record_by_id(id_b).unwrap().group_id
    );

    let record_a = a.db.record_by_id(id_a).unwrap();
    let sidecar_a = sidecar::sidecar_path(&a.hot.path().join(&record_a.storage_path));

    // Replaying our own write is a no-op.
    assert_eq!(
        a.sync.on_external_change(&sidecar_a).unwrap(),
        SyncOutcome::SelfAuthored
    );

    // An external editor names a person.
    let mut doc = sidecar::load_document(&sidecar_a).unwrap();
    doc.region_list.push(SidecarRegion {
        name: "Emma".to_string(),
        region_type: "Face".to_string(),
        area: RegionArea { x: 0.4, y: 0.35, w: 0.2, h: 0.3 },
        confidence: None,
        verifying_actor: Some("digikam".to_string()),
    });
    doc.stamp = None;
    std::fs::write(&sidecar_a, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

    assert_eq!(
        a.sync.on_external_change(&sidecar_a).unwrap(),
        SyncOutcome::Applied { records_updated: 2 }
    );

    for id in [id_a, id_b] {
        let annotations = a.db.annotations_for(id).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].person_name, "Emma");
        assert!(annotations[0].is_confirmed());

        let record = a.db.record_by_id(id).unwrap();
        let path = sidecar::sidecar_path(&a.hot.path().join(&record.storage_path));
        let rendered = sidecar::load_document(&path).unwrap();
        assert_eq!(rendered.region_list.len(), 1);
        assert_eq!(rendered.stamp, record.sidecar_stamp);
    }

    // The rewritten sidecar is recognized as ours again.
    assert_eq!(
        a.sync.on_external_change(&sidecar_a).unwrap(),
        SyncOutcome::SelfAuthored
    );
}

#[test]
fn tier_moves_preserve_payload_and_carry_sidecar() {
    let a = archive();
    let inbox = tempfile::tempdir().unwrap();
    let original = inbox.path().join("IMG_0300.png");
    scene().save(&original).unwrap();
    let id = stored(a.ingestor.ingest_file(&original, "icloud").unwrap());

    let record = a.db.record_by_id(id).unwrap();
    let payload = std::fs::read(a.hot.path().join(&record.storage_path)).unwrap();

    a.manager.demote(&record, Tier::Warm).unwrap();
    let record = a.db.record_by_id(id).unwrap();
    assert_eq!(record.storage_tier, "warm");

    a.manager.demote(&record, Tier::Cold).unwrap();
    let record = a.db.record_by_id(id).unwrap();
    assert_eq!(record.storage_tier, "cold");

    let cold_path = a.manager.roots().absolute(&record).unwrap();
    assert_eq!(std::fs::read(&cold_path).unwrap(), payload);
    assert!(cold_path.metadata().unwrap().permissions().readonly());
    assert!(sidecar::sidecar_path(&cold_path).exists());
    assert!(!a.hot.path().join(&record.storage_path).exists());

    // Fetch brings it back to warm and records the access.
    let fp: ExactFingerprint = record.exact_fingerprint.parse().unwrap();
    let fetched = a.manager.fetch(&fp).unwrap();
    assert_eq!(std::fs::read(&fetched).unwrap(), payload);
    let record = a.db.record_by_id(id).unwrap();
    assert_eq!(record.storage_tier, "warm");
    assert!(record.last_accessed_at.is_some());
}
