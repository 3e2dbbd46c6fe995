//! Bidirectional sidecar synchronization.
//!
//! Inward: a sidecar edit observed on disk is parsed, checked against the
//! stored stamp (self-authored writes are dropped, preventing feedback
//! loops), and merged through the reconciler. Outward: after any record
//! mutation the sidecars of the whole derivative family are re-rendered.

use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, Result};
use crate::reconcile::{FieldValue, MetadataSet, ReconcilePolicy};
use crate::sidecar::{
    self, DeviceBlock, Provenance, RegionArea, SidecarDocument, SidecarField, SidecarRegion,
};
use crate::store::{Database, MediaRecord, Region};
use crate::tier::TierRoots;

/// Sidecar edits carry this source id through the reconciler.
pub const SIDECAR_SOURCE: &str = "sidecar";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The change was our own write landing back on disk.
    SelfAuthored,
    /// An external edit was merged. Counts the records whose sidecars were
    /// re-rendered as a result.
    Applied { records_updated: usize },
    /// The path does not correspond to any live record.
    Unmatched,
}

pub struct Synchronizer {
    db: Arc<Database>,
    policy: ReconcilePolicy,
    roots: TierRoots,
}

impl Synchronizer {
    pub fn new(db: Arc<Database>, policy: ReconcilePolicy, roots: TierRoots) -> Self {
        Self { db, policy, roots }
    }

    /// Projects a record's database state into a sidecar document. Keywords
    /// live in their own array; everything else stays in the field map.
    pub fn render_document(&self, record: &MediaRecord) -> Result<SidecarDocument> {
        let mut fields = self.db.merged_fields(record.id)?;

        let keywords = fields
            .remove("keywords")
            .map(|fv| parse_keyword_list(&fv.value))
            .unwrap_or_default();

        let device_verification = render_device_block(&fields);

        let region_list = self
            .db
            .annotations_for(record.id)?
            .into_iter()
            .map(|a| SidecarRegion {
                name: a.person_name,
                region_type: "Face".to_string(),
                area: RegionArea {
                    x: a.region.x,
                    y: a.region.y,
                    w: a.region.w,
                    h: a.region.h,
                },
                confidence: a.confidence,
                verifying_actor: a.verifying_actor,
            })
            .collect();

        let processing_history = self
            .db
            .history_for(record.id)?
            .into_iter()
            .map(|h| match h.detail {
                Some(detail) => format!("{} {}: {}", h.occurred_at, h.action, detail),
                None => format!("{} {}", h.occurred_at, h.action),
            })
            .collect();

        Ok(SidecarDocument {
            version: record.sidecar_version + 1,
            stamp: None,
            provenance: Provenance {
                exact_fingerprint: record.exact_fingerprint.clone(),
                source_tags: self.db.source_tags(record.id)?,
                device_verification,
            },
            fields: fields
                .into_iter()
                .map(|(key, fv)| (key, SidecarField { value: fv.value, source: fv.source }))
                .collect(),
            keywords,
            region_list,
            quality_score: record.quality_score,
            processing_history,
        })
    }

    /// Renders, stamps, and atomically writes a record's sidecar. The stamp
    /// is stored before the file becomes visible so a watcher event arriving
    /// right after the rename already matches and reads as self-authored.
    pub fn write_sidecar(&self, record: &MediaRecord) -> Result<PathBuf> {
        let mut document = self.render_document(record)?;
        let stamp = document.finalize()?;
        self.db.set_sidecar_stamp(record.id, &stamp, document.version)?;

        let media_path = self.roots.absolute(record)?;
        let path = sidecar::sidecar_path(&media_path);
        sidecar::write_document(&path, &document)?;

        debug!(record = record.id, path = %path.display(), "sidecar written");
        Ok(path)
    }

    /// Re-renders the sidecar of every live member of a group.
    pub fn write_group_sidecars(&self, group_id: i64) -> Result<usize> {
        let members = self.db.group_members(group_id)?;
        for member in &members {
            self.write_sidecar(member)?;
        }
        Ok(members.len())
    }

    /// Handles a sidecar file observed changing on disk.
    pub fn on_external_change(&self, path: &Path) -> Result<SyncOutcome> {
        let document = sidecar::load_document(path)?;

        let Some(record) = self
            .db
            .record_by_fingerprint(&document.provenance.exact_fingerprint)?
            .filter(|r| !r.tombstoned)
        else {
            return Ok(SyncOutcome::Unmatched);
        };

        // Loop prevention: our own write echoes back with the stamp we
        // stored. Anything else, stamp edited, cleared, or stale, is an
        // external change.
        if document.stamp.is_some() && document.stamp == record.sidecar_stamp {
            return Ok(SyncOutcome::SelfAuthored);
        }

        let incoming = incoming_fields(&document);
        self.apply_regions(&record, &document)?;

        let group_id = match record.group_id {
            Some(group_id) => group_id,
            None => {
                let group_id = self.db.create_group()?;
                self.db.set_group(record.id, group_id)?;
                group_id
            }
        };
        self.db.merge_into_group(group_id, &incoming, &self.policy)?;

        if let Some(score) = document.quality_score {
            self.db.set_quality_score(record.id, score)?;
        }
        self.db.add_history(
            record.id,
            "sidecar-merged",
            Some(&path.display().to_string()),
            Some(SIDECAR_SOURCE),
        )?;

        let records_updated = self.write_group_sidecars(group_id)?;
        info!(
            record = record.id,
            group = group_id,
            records_updated,
            "external sidecar edit merged"
        );
        Ok(SyncOutcome::Applied { records_updated })
    }

    /// Person regions from an edited sidecar. A region the document marks
    /// with a verifying actor, or one it adds fresh, is an external
    /// assertion; it displaces any overlapping unconfirmed guess. Regions
    /// propagate to every member of the derivative family.
    fn apply_regions(&self, record: &MediaRecord, document: &SidecarDocument) -> Result<()> {
        if document.region_list.is_empty() {
            return Ok(());
        }

        let existing = self.db.annotations_for(record.id)?;
        let targets: Vec<i64> = match record.group_id {
            Some(group_id) => self.db.group_members(group_id)?.iter().map(|m| m.id).collect(),
            None => vec![record.id],
        };

        for region in &document.region_list {
            let person = self.db.find_or_create_person(&region.name)?;
            let area = Region {
                x: region.area.x,
                y: region.area.y,
                w: region.area.w,
                h: region.area.h,
            };

            let known = existing.iter().any(|a| {
                a.person_id == person.id
                    && a.region.overlaps(&area)
                    && a.verifying_actor == region.verifying_actor
            });
            if known {
                continue;
            }

            let actor = region
                .verifying_actor
                .clone()
                .or_else(|| Some(SIDECAR_SOURCE.to_string()));

            for target in &targets {
                self.db.upsert_person_annotation(
                    *target,
                    person.id,
                    area,
                    region.confidence,
                    actor.as_deref(),
                )?;
            }
        }
        Ok(())
    }

    /// Watches one tier root for sidecar edits on a dedicated thread.
    pub fn spawn_watcher(self: &Arc<Self>, root: PathBuf) -> Result<JoinHandle<()>> {
        let sync = Arc::clone(self);
        std::fs::create_dir_all(&root).map_err(|e| ArchiveError::io(&root, e))?;

        let (tx, rx) = mpsc::channel::<std::result::Result<Event, notify::Error>>();
        let mut watcher = recommended_watcher(tx)
            .map_err(|e| ArchiveError::io(&root, std::io::Error::other(e)))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| ArchiveError::io(&root, std::io::Error::other(e)))?;

        info!(root = %root.display(), "sidecar watcher started");
        let handle = std::thread::spawn(move || {
            // Keeps the watcher alive for the thread's lifetime.
            let _watcher = watcher;
            for res in rx {
                match res {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                        for path in event.paths {
                            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                                continue;
                            }
                            if !path.is_file() {
                                continue;
                            }
                            match sync.on_external_change(&path) {
                                Ok(SyncOutcome::SelfAuthored) => {}
                                Ok(SyncOutcome::Unmatched) => {
                                    debug!(path = %path.display(), "sidecar matches no record");
                                }
                                Ok(SyncOutcome::Applied { records_updated }) => {
                                    debug!(
                                        path = %path.display(),
                                        records_updated,
                                        "sidecar change applied"
                                    );
                                }
                                Err(e) => {
                                    warn!(path = %path.display(), error = %e, "sidecar sync failed");
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "watch error"),
                }
            }
        });
        Ok(handle)
    }
}

fn parse_keyword_list(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(_) => vec![raw.to_string()],
    }
}

fn render_device_block(fields: &MetadataSet) -> Option<DeviceBlock> {
    let confidence = fields.get("device.confidence")?;
    Some(DeviceBlock {
        make: fields.get("device.make").map(|f| f.value.clone()),
        model: fields.get("device.model").map(|f| f.value.clone()),
        os_version: fields.get("device.os_version").map(|f| f.value.clone()),
        confidence: confidence.value.parse().unwrap_or(0.0),
    })
}

/// Field set carried by an edited sidecar. Fields keep their declared
/// source when it is plausible; a field with no source is an edit made in
/// the sidecar itself. Keywords become a JSON array field.
fn incoming_fields(document: &SidecarDocument) -> MetadataSet {
    let mut fields = MetadataSet::new();
    for (key, field) in &document.fields {
        let source = if field.source.is_empty() {
            SIDECAR_SOURCE.to_string()
        } else {
            field.source.clone()
        };
        fields.insert(key.clone(), FieldValue::new(field.value.clone(), source));
    }

    if !document.keywords.is_empty() {
        let mut keywords = document.keywords.clone();
        keywords.sort();
        keywords.dedup();
        if let Ok(json) = serde_json::to_string(&keywords) {
            fields.insert("keywords".to_string(), FieldValue::new(json, SIDECAR_SOURCE));
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MediaKind, NewRecord};
    use tempfile::TempDir;

    struct Fixture {
        db: Arc<Database>,
        sync: Arc<Synchronizer>,
        hot: TempDir,
        _dirs: Vec<TempDir>,
    }

    fn fixture() -> Fixture {
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

        let policy = Config::default().reconcile_policy();
        let sync = Arc::new(Synchronizer::new(db.clone(), policy, roots));
        Fixture { db, sync, hot, _dirs: vec![warm, cold] }
    }

    fn seed(f: &Fixture, fingerprint: &str, rel: &str) -> MediaRecord {
        let absolute = f.hot.path().join(rel);
        std::fs::create_dir_all(absolute.parent().unwrap()).unwrap();
        std::fs::write(&absolute, fingerprint.as_bytes()).unwrap();

        let id = f
            .db
            .insert_record(&NewRecord {
                exact_fingerprint: fingerprint.to_string(),
                approx_fingerprint: None,
                media_kind: MediaKind::Picture,
                size_bytes: 8,
                storage_tier: "hot".to_string(),
                storage_path: rel.to_string(),
                group_id: None,
                capture_time: None,
                gps_latitude: None,
                gps_longitude: None,
                gps_accuracy_m: None,
                gps_recorded_at: None,
                device_make: None,
                device_model: None,
                device_os_version: None,
            })
            .unwrap();
        f.db.record_by_id(id).unwrap()
    }

    #[test]
    fn own_write_round_trips_as_self_authored() {
        let f = fixture();
        let record = seed(&f, &"aa".repeat(32), "2024/2024-01/pictures/a.jpg");
        f.db.add_source_tag(record.id, "icloud", None).unwrap();

        let path = f.sync.write_sidecar(&record).unwrap();
        let before = f.db.record_by_id(record.id).unwrap();

        // The watcher event for our own write changes nothing.
        let outcome = f.sync.on_external_change(&path).unwrap();
        assert_eq!(outcome, SyncOutcome::SelfAuthored);

        let after = f.db.record_by_id(record.id).unwrap();
        assert_eq!(after.sidecar_stamp, before.sidecar_stamp);
        assert_eq!(after.sidecar_version, before.sidecar_version);
        assert_eq!(sidecar::load_document(&path).unwrap().version, after.sidecar_version);
    }

    #[test]
    fn event_arriving_right_after_rename_is_self_authored() {
        let f = fixture();
        let record = seed(&f, &"dd".repeat(32), "2024/2024-02/pictures/d.jpg");
        let path = sidecar::sidecar_path(&f.hot.path().join(&record.storage_path));

        // Stand-in for the watch loop: dispatch the instant the file shows
        // up, which lands inside write_sidecar on a slow enough machine.
        let sync = f.sync.clone();
        let observed = path.clone();
        let handle = std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            while !observed.exists() && std::time::Instant::now() < deadline {
                std::thread::yield_now();
            }
            sync.on_external_change(&observed)
        });

        let written = f.sync.write_sidecar(&record).unwrap();
        assert_eq!(written, path);
        assert_eq!(handle.join().unwrap().unwrap(), SyncOutcome::SelfAuthored);

        // No spurious re-merge bumped the version behind our back.
        let after = f.db.record_by_id(record.id).unwrap();
        assert_eq!(sidecar::load_document(&path).unwrap().version, after.sidecar_version);
    }

    #[test]
    fn external_keyword_edit_merges_and_restamps() {
        let f = fixture();
        let record = seed(&f, &"ab".repeat(32), "2024/2024-01/pictures/a.jpg");
        let path = f.sync.write_sidecar(&record).unwrap();

        let mut doc = sidecar::load_document(&path).unwrap();
        doc.keywords.push("holiday".to_string());
        doc.stamp = None;
        std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

        let outcome = f.sync.on_external_change(&path).unwrap();
        assert_eq!(outcome, SyncOutcome::Applied { records_updated: 1 });

        let fields = f.db.merged_fields(record.id).unwrap();
        assert_eq!(fields["keywords"].value, r#"["holiday"]"#);
        assert_eq!(fields["keywords"].source, SIDECAR_SOURCE);

        // The re-rendered sidecar is stamped and self-consistent.
        let rendered = sidecar::load_document(&path).unwrap();
        let record = f.db.record_by_id(record.id).unwrap();
        assert_eq!(rendered.stamp, record.sidecar_stamp);
        assert_eq!(rendered.keywords, vec!["holiday"]);
    }

    #[test]
    fn person_edit_propagates_to_group_siblings() {
        let f = fixture();
        let a = seed(&f, &"aa".repeat(32), "2024/2024-01/pictures/a.jpg");
        let b = seed(&f, &"bb".repeat(32), "2024/2024-01/pictures/b.jpg");
        let group = f.db.create_group().unwrap();
        f.db.set_group(a.id, group).unwrap();
        f.db.set_group(b.id, group).unwrap();
        let a = f.db.record_by_id(a.id).unwrap();
        let b = f.db.record_by_id(b.id).unwrap();

        let path_a = f.sync.write_sidecar(&a).unwrap();
        let path_b = f.sync.write_sidecar(&b).unwrap();

        let mut doc = sidecar::load_document(&path_a).unwrap();
        doc.region_list.push(SidecarRegion {
            name: "Alice".to_string(),
            region_type: "Face".to_string(),
            area: RegionArea { x: 0.5, y: 0.4, w: 0.2, h: 0.25 },
            confidence: None,
            verifying_actor: Some("digikam".to_string()),
        });
        doc.stamp = None;
        std::fs::write(&path_a, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

        let outcome = f.sync.on_external_change(&path_a).unwrap();
        assert_eq!(outcome, SyncOutcome::Applied { records_updated: 2 });

        for id in [a.id, b.id] {
            let annotations = f.db.annotations_for(id).unwrap();
            assert_eq!(annotations.len(), 1);
            assert_eq!(annotations[0].person_name, "Alice");
            assert!(annotations[0].is_confirmed());
        }

        // Both sidecars now carry the region.
        let rendered_b = sidecar::load_document(&path_b).unwrap();
        assert_eq!(rendered_b.region_list.len(), 1);
        assert_eq!(rendered_b.region_list[0].name, "Alice");
    }

    #[test]
    fn external_region_displaces_classifier_guess() {
        let f = fixture();
        let record = seed(&f, &"cc".repeat(32), "2024/2024-01/pictures/c.jpg");
        let person = f.db.find_or_create_person("Maybe-Bob").unwrap();
        f.db.upsert_person_annotation(
            record.id,
            person.id,
            Region { x: 0.5, y: 0.5, w: 0.2, h: 0.2 },
            Some(0.6),
            None,
        )
        .unwrap();

        let path = f.sync.write_sidecar(&record).unwrap();
        let mut doc = sidecar::load_document(&path).unwrap();
        doc.region_list = vec![SidecarRegion {
            name: "Alice".to_string(),
            region_type: "Face".to_string(),
            area: RegionArea { x: 0.52, y: 0.5, w: 0.2, h: 0.2 },
            confidence: None,
            verifying_actor: None,
        }];
        doc.stamp = None;
        std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

        f.sync.on_external_change(&path).unwrap();

        let annotations = f.db.annotations_for(record.id).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].person_name, "Alice");
        assert_eq!(annotations[0].verifying_actor.as_deref(), Some(SIDECAR_SOURCE));
    }

    #[test]
    fn unknown_fingerprint_is_unmatched() {
        let f = fixture();
        let path = f.hot.path().join("stray.jpg.json");
        let doc = SidecarDocument {
            version: 1,
            stamp: None,
            provenance: Provenance {
                exact_fingerprint: "ff".repeat(32),
                source_tags: vec![],
                device_verification: None,
            },
            fields: Default::default(),
            keywords: vec![],
            region_list: vec![],
            quality_score: None,
            processing_history: vec![],
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
        assert_eq!(f.sync.on_external_change(&path).unwrap(), SyncOutcome::Unmatched);
    }
}
