//! Canonical archive store backed by SQLite.
//!
//! One row per unique byte payload, keyed by exact fingerprint. Provenance,
//! reconciled fields, people, and history hang off that row. All access goes
//! through [`Database`], which serializes on a single connection.

pub mod locks;
pub mod records;
pub mod schema;

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{ArchiveError, Result};
use crate::reconcile::{self, FieldValue, MetadataSet, ReconcilePolicy};
pub use locks::{KeyGuard, LockRegistry};
pub use records::{
    HistoryEntry, MediaKind, MediaRecord, NewRecord, Person, PersonAnnotation, Region,
};
use schema::{MIGRATIONS, SCHEMA};

pub struct Database {
    conn: Mutex<Connection>,
}

const RECORD_COLUMNS: &str = "id, exact_fingerprint, approx_fingerprint, media_kind, size_bytes, \
     storage_tier, storage_path, group_id, capture_time, \
     gps_latitude, gps_longitude, gps_accuracy_m, gps_recorded_at, \
     device_make, device_model, device_os_version, \
     quality_score, tombstoned, sidecar_stamp, sidecar_version, \
     first_seen_at, last_accessed_at";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaRecord> {
    let kind: String = row.get(3)?;
    Ok(MediaRecord {
        id: row.get(0)?,
        exact_fingerprint: row.get(1)?,
        approx_fingerprint: row.get(2)?,
        media_kind: MediaKind::parse(&kind).unwrap_or(MediaKind::Picture),
        size_bytes: row.get(4)?,
        storage_tier: row.get(5)?,
        storage_path: row.get(6)?,
        group_id: row.get(7)?,
        capture_time: row.get(8)?,
        gps_latitude: row.get(9)?,
        gps_longitude: row.get(10)?,
        gps_accuracy_m: row.get(11)?,
        gps_recorded_at: row.get(12)?,
        device_make: row.get(13)?,
        device_model: row.get(14)?,
        device_os_version: row.get(15)?,
        quality_score: row.get(16)?,
        tombstoned: row.get::<_, i64>(17)? != 0,
        sidecar_stamp: row.get(18)?,
        sidecar_version: row.get(19)?,
        first_seen_at: row.get(20)?,
        last_accessed_at: row.get(21)?,
    })
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            // Fails harmlessly when the column already exists.
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // Records
    // ========================================================================

    pub fn insert_record(&self, record: &NewRecord) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO media_records (
                exact_fingerprint, approx_fingerprint, media_kind, size_bytes,
                storage_tier, storage_path, group_id, capture_time,
                gps_latitude, gps_longitude, gps_accuracy_m, gps_recorded_at,
                device_make, device_model, device_os_version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.exact_fingerprint,
                record.approx_fingerprint,
                record.media_kind.as_str(),
                record.size_bytes,
                record.storage_tier,
                record.storage_path,
                record.group_id,
                record.capture_time,
                record.gps_latitude,
                record.gps_longitude,
                record.gps_accuracy_m,
                record.gps_recorded_at,
                record.device_make,
                record.device_model,
                record.device_os_version,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_by_fingerprint(&self, exact: &str) -> Result<Option<MediaRecord>> {
        let conn = self.conn();
        let result = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM media_records WHERE exact_fingerprint = ?"),
                [exact],
                row_to_record,
            )
            .optional()?;
        Ok(result)
    }

    pub fn record_by_id(&self, id: i64) -> Result<MediaRecord> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM media_records WHERE id = ?"),
            [id],
            row_to_record,
        )
        .optional()?
        .ok_or_else(|| ArchiveError::RecordNotFound(format!("record id {id}")))
    }

    pub fn record_by_storage_path(&self, tier: &str, rel_path: &str) -> Result<Option<MediaRecord>> {
        let conn = self.conn();
        let result = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM media_records \
                     WHERE storage_tier = ? AND storage_path = ?"
                ),
                params![tier, rel_path],
                row_to_record,
            )
            .optional()?;
        Ok(result)
    }

    /// Locates a record by relative path in any tier. Sidecar watchers only
    /// know the path they saw change.
    pub fn record_by_relative_path(&self, rel_path: &str) -> Result<Option<MediaRecord>> {
        let conn = self.conn();
        let result = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM media_records WHERE storage_path = ?"),
                [rel_path],
                row_to_record,
            )
            .optional()?;
        Ok(result)
    }

    pub fn records_in_tier(&self, tier: &str) -> Result<Vec<MediaRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM media_records \
             WHERE storage_tier = ? AND tombstoned = 0 ORDER BY id"
        ))?;
        let records = stmt
            .query_map([tier], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// All live perceptual fingerprints, for rebuilding the in-memory index.
    pub fn approx_fingerprints(&self) -> Result<Vec<(i64, String, Option<i64>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, approx_fingerprint, group_id FROM media_records \
             WHERE approx_fingerprint IS NOT NULL AND tombstoned = 0",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_storage(&self, record_id: i64, tier: &str, rel_path: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE media_records SET storage_tier = ?, storage_path = ? WHERE id = ?",
            params![tier, rel_path, record_id],
        )?;
        Ok(())
    }

    pub fn set_quality_score(&self, record_id: i64, score: f64) -> Result<()> {
        self.conn().execute(
            "UPDATE media_records SET quality_score = ? WHERE id = ?",
            params![score, record_id],
        )?;
        Ok(())
    }

    pub fn touch_last_accessed(&self, record_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE media_records SET last_accessed_at = CURRENT_TIMESTAMP WHERE id = ?",
            [record_id],
        )?;
        Ok(())
    }

    /// Deletion is logical. The row and its provenance survive so a
    /// re-import of the same bytes is recognized, not resurrected.
    pub fn tombstone(&self, record_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE media_records SET tombstoned = 1 WHERE id = ?",
            [record_id],
        )?;
        Ok(())
    }

    pub fn set_sidecar_stamp(&self, record_id: i64, stamp: &str, version: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE media_records SET sidecar_stamp = ?, sidecar_version = ? WHERE id = ?",
            params![stamp, version, record_id],
        )?;
        Ok(())
    }

    /// Projects the reconciled field set onto the denormalized capture
    /// columns, so what the policy decided is also what the columns say.
    /// Keys the merged set does not carry leave their columns untouched.
    pub fn apply_reconciled_summary(&self, record_id: i64, fields: &MetadataSet) -> Result<()> {
        let text = |key: &str| fields.get(key).map(|fv| fv.value.as_str());
        let number = |key: &str| fields.get(key).and_then(|fv| fv.value.parse::<f64>().ok());
        self.conn().execute(
            r#"
            UPDATE media_records SET
                capture_time = COALESCE(?, capture_time),
                gps_latitude = COALESCE(?, gps_latitude),
                gps_longitude = COALESCE(?, gps_longitude),
                gps_accuracy_m = COALESCE(?, gps_accuracy_m),
                gps_recorded_at = COALESCE(?, gps_recorded_at),
                device_make = COALESCE(?, device_make),
                device_model = COALESCE(?, device_model),
                device_os_version = COALESCE(?, device_os_version)
            WHERE id = ?
            "#,
            params![
                text("capture.time"),
                number("gps.latitude"),
                number("gps.longitude"),
                number("gps.accuracy_m"),
                text("gps.timestamp"),
                text("device.make"),
                text("device.model"),
                text("device.os_version"),
                record_id,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Provenance
    // ========================================================================

    pub fn add_source_tag(
        &self,
        record_id: i64,
        source_id: &str,
        original_path: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO source_tags (record_id, source_id, original_path)
            VALUES (?, ?, ?)
            ON CONFLICT (record_id, source_id) DO UPDATE SET
                original_path = COALESCE(excluded.original_path, original_path)
            "#,
            params![record_id, source_id, original_path],
        )?;
        Ok(())
    }

    pub fn source_tags(&self, record_id: i64) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source_id FROM source_tags WHERE record_id = ? ORDER BY source_id",
        )?;
        let tags = stmt
            .query_map([record_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    // ========================================================================
    // Merged fields
    // ========================================================================

    pub fn merged_fields(&self, record_id: i64) -> Result<MetadataSet> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT field_key, field_value, source_id FROM merged_fields WHERE record_id = ?",
        )?;
        let mut fields = MetadataSet::new();
        let rows = stmt.query_map([record_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (key, value, source) = row?;
            fields.insert(key, FieldValue::new(value, source));
        }
        Ok(fields)
    }

    pub fn replace_merged_fields(&self, record_id: i64, fields: &MetadataSet) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM merged_fields WHERE record_id = ?", [record_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO merged_fields (record_id, field_key, field_value, source_id) \
                 VALUES (?, ?, ?, ?)",
            )?;
            for (key, fv) in fields {
                stmt.execute(params![record_id, key, fv.value, fv.source])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Similarity groups
    // ========================================================================

    pub fn create_group(&self) -> Result<i64> {
        let conn = self.conn();
        conn.execute("INSERT INTO similarity_groups DEFAULT VALUES", [])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_group(&self, record_id: i64, group_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE media_records SET group_id = ? WHERE id = ?",
            params![group_id, record_id],
        )?;
        Ok(())
    }

    pub fn group_members(&self, group_id: i64) -> Result<Vec<MediaRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM media_records \
             WHERE group_id = ? AND tombstoned = 0 ORDER BY id"
        ))?;
        let records = stmt
            .query_map([group_id], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Merges two groups, keeping the smaller id so the surviving group is
    /// independent of ingest order. The two groups' merged field sets are
    /// reconciled into the survivor so a union never drops a field either
    /// side carried. Returns the surviving id.
    pub fn union_groups(&self, a: i64, b: i64, policy: &ReconcilePolicy) -> Result<i64> {
        if a == b {
            return Ok(a);
        }
        let (keep, absorb) = if a < b { (a, b) } else { (b, a) };

        let kept_fields = self.group_fields(keep)?;
        let absorbed_fields = self.group_fields(absorb)?;
        let merged = reconcile::reconcile(&kept_fields, &absorbed_fields, policy);

        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE media_records SET group_id = ? WHERE group_id = ?",
                params![keep, absorb],
            )?;
            tx.execute("DELETE FROM similarity_groups WHERE id = ?", [absorb])?;
            tx.commit()?;
        }

        for member in self.group_members(keep)? {
            self.replace_merged_fields(member.id, &merged)?;
        }
        debug!(keep, absorb, "merged similarity groups");
        Ok(keep)
    }

    pub fn group_exists(&self, group_id: i64) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM similarity_groups WHERE id = ?",
            [group_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The group's shared field set, read off any live member. An empty
    /// group carries no fields.
    fn group_fields(&self, group_id: i64) -> Result<MetadataSet> {
        match self.group_members(group_id)?.first() {
            Some(representative) => self.merged_fields(representative.id),
            None => Ok(MetadataSet::new()),
        }
    }

    /// Reconciles `incoming` against the group's shared field set and writes
    /// the result to every live member. The merge is pure; persistence here
    /// is a single transaction.
    pub fn merge_into_group(
        &self,
        group_id: i64,
        incoming: &MetadataSet,
        policy: &ReconcilePolicy,
    ) -> Result<MetadataSet> {
        let members = self.group_members(group_id)?;
        let representative = members
            .first()
            .ok_or_else(|| ArchiveError::RecordNotFound(format!("group {group_id} is empty")))?;

        let existing = self.merged_fields(representative.id)?;
        let merged = reconcile::reconcile(&existing, incoming, policy);

        for member in &members {
            self.replace_merged_fields(member.id, &merged)?;
        }
        Ok(merged)
    }

    // ========================================================================
    // People and annotations
    // ========================================================================

    pub fn find_or_create_person(&self, name: &str) -> Result<Person> {
        let conn = self.conn();
        let existing = conn
            .query_row(
                "SELECT id, name, birthdate, verified FROM people WHERE name = ?",
                [name],
                |row| {
                    Ok(Person {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        birthdate: row.get(2)?,
                        verified: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        if let Some(person) = existing {
            return Ok(person);
        }
        conn.execute("INSERT INTO people (name) VALUES (?)", [name])?;
        Ok(Person {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            birthdate: None,
            verified: false,
        })
    }

    pub fn set_person_verified(&self, person_id: i64, verified: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE people SET verified = ? WHERE id = ?",
            params![verified as i64, person_id],
        )?;
        Ok(())
    }

    pub fn set_person_birthdate(&self, person_id: i64, birthdate: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE people SET birthdate = ? WHERE id = ?",
            params![birthdate, person_id],
        )?;
        Ok(())
    }

    /// Inserts or updates an annotation for a face region.
    ///
    /// An externally verified assertion replaces any overlapping unverified
    /// classifier guess. An unverified guess never displaces a verified
    /// annotation on the same region; it is dropped instead.
    pub fn upsert_person_annotation(
        &self,
        record_id: i64,
        person_id: i64,
        region: Region,
        confidence: Option<f64>,
        verifying_actor: Option<&str>,
    ) -> Result<()> {
        let existing = self.annotations_for(record_id)?;

        for old in existing.iter().filter(|a| a.region.overlaps(&region)) {
            if verifying_actor.is_some() {
                self.conn().execute(
                    "DELETE FROM person_annotations WHERE id = ?",
                    [old.id],
                )?;
            } else {
                // Unverified guess on an already-annotated region.
                return Ok(());
            }
        }

        self.conn().execute(
            r#"
            INSERT INTO person_annotations
                (record_id, person_id, region_x, region_y, region_w, region_h,
                 confidence, verifying_actor)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record_id,
                person_id,
                region.x,
                region.y,
                region.w,
                region.h,
                confidence,
                verifying_actor,
            ],
        )?;
        Ok(())
    }

    pub fn annotations_for(&self, record_id: i64) -> Result<Vec<PersonAnnotation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT a.id, a.record_id, a.person_id, p.name,
                   a.region_x, a.region_y, a.region_w, a.region_h,
                   a.confidence, a.verifying_actor
            FROM person_annotations a
            JOIN people p ON a.person_id = p.id
            WHERE a.record_id = ?
            ORDER BY a.id
            "#,
        )?;
        let annotations = stmt
            .query_map([record_id], |row| {
                Ok(PersonAnnotation {
                    id: row.get(0)?,
                    record_id: row.get(1)?,
                    person_id: row.get(2)?,
                    person_name: row.get(3)?,
                    region: Region {
                        x: row.get(4)?,
                        y: row.get(5)?,
                        w: row.get(6)?,
                        h: row.get(7)?,
                    },
                    confidence: row.get(8)?,
                    verifying_actor: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(annotations)
    }

    pub fn has_confirmed_person(&self, record_id: i64) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM person_annotations \
             WHERE record_id = ? AND verifying_actor IS NOT NULL",
            [record_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // History
    // ========================================================================

    pub fn add_history(
        &self,
        record_id: i64,
        action: &str,
        detail: Option<&str>,
        source_id: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO processing_history (record_id, action, detail, source_id) \
             VALUES (?, ?, ?, ?)",
            params![record_id, action, detail, source_id],
        )?;
        Ok(())
    }

    pub fn history_for(&self, record_id: i64) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT action, detail, source_id, occurred_at FROM processing_history \
             WHERE record_id = ? ORDER BY id",
        )?;
        let entries = stmt
            .query_map([record_id], |row| {
                Ok(HistoryEntry {
                    action: row.get(0)?,
                    detail: row.get(1)?,
                    source_id: row.get(2)?,
                    occurred_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}
