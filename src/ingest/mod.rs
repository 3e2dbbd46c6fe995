//! Ingest pipeline.
//!
//! One file at a time: fingerprint, dedup, similarity grouping, placement,
//! reconciliation, sidecar. Batches fan out over a thread pool; a failed
//! file is reported and never aborts the rest of the batch.

pub mod exif;

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{ArchiveError, Result};
use crate::identity::{compute_approx, compute_exact, ApproxFingerprint};
use crate::layout;
use crate::reconcile::{MetadataSet, ReconcilePolicy};
use crate::similarity::SimilarityIndex;
use crate::store::{Database, KeyGuard, LockRegistry, MediaKind, NewRecord};
use crate::sync::Synchronizer;
use crate::tier::{Tier, TierRoots};

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub picture_extensions: Vec<String>,
    pub video_extensions: Vec<String>,
    pub similarity_threshold: u32,
    pub io_retries: u32,
    pub retry_backoff: Duration,
    pub lock_timeout: Duration,
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            picture_extensions: config.scanner.picture_extensions.clone(),
            video_extensions: config.scanner.video_extensions.clone(),
            similarity_threshold: config.scanner.similarity_threshold,
            io_retries: config.ingest.io_retries,
            retry_backoff: Duration::from_millis(config.ingest.retry_backoff_ms),
            lock_timeout: Duration::from_millis(config.ingest.lock_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New payload archived.
    Stored { record_id: i64 },
    /// Bytes already known; provenance and metadata were merged onto the
    /// existing record, nothing was written to the archive.
    Duplicate { record_id: i64 },
    /// Extension matches neither configured media list.
    SkippedUnsupported,
    /// Cancellation was requested before this file reached a safe point.
    Cancelled,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub stored: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failed: Vec<(PathBuf, String)>,
}

pub struct Ingestor {
    db: Arc<Database>,
    index: Arc<SimilarityIndex>,
    locks: LockRegistry,
    policy: ReconcilePolicy,
    roots: TierRoots,
    sync: Arc<Synchronizer>,
    options: IngestOptions,
    cancel: Arc<AtomicBool>,
}

impl Ingestor {
    pub fn new(
        db: Arc<Database>,
        index: Arc<SimilarityIndex>,
        sync: Arc<Synchronizer>,
        policy: ReconcilePolicy,
        roots: TierRoots,
        options: IngestOptions,
    ) -> Self {
        Self {
            db,
            index,
            locks: LockRegistry::new(),
            policy,
            roots,
            sync,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag a supervisor can flip to stop a running batch. Files
    /// already past their fingerprint lock complete normally.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn ingest_file(&self, path: &Path, source_id: &str) -> Result<IngestOutcome> {
        self.ingest_with_metadata(path, source_id, &MetadataSet::new())
    }

    /// Ingest with importer-supplied fields (album names, upstream ratings)
    /// folded into the reconcile pass under the importer's source id.
    pub fn ingest_with_metadata(
        &self,
        path: &Path,
        source_id: &str,
        extra: &MetadataSet,
    ) -> Result<IngestOutcome> {
        let Some(kind) = layout::media_kind_for(
            path,
            &self.options.picture_extensions,
            &self.options.video_extensions,
        ) else {
            debug!(path = %path.display(), "extension not configured, skipping");
            return Ok(IngestOutcome::SkippedUnsupported);
        };

        let exact = self.hash_with_retries(path)?;
        let hex = exact.to_hex();

        if self.cancel.load(Ordering::Relaxed) {
            return Ok(IngestOutcome::Cancelled);
        }

        // One worker per payload. A concurrent presentation of the same
        // bytes waits here and then takes the duplicate path.
        let _guard = self.locks.acquire(&hex, self.options.lock_timeout)?;

        if let Some(existing) = self.db.record_by_fingerprint(&hex)? {
            return self.absorb_duplicate(existing.id, path, source_id, extra);
        }

        let summary = exif::extract_capture_summary(path);

        let approx = match kind {
            MediaKind::Picture => match compute_approx(path) {
                Ok(fp) => Some(fp),
                Err(ArchiveError::UnsupportedFormat { detail, .. }) => {
                    // Stored by exact identity only; it just never joins a
                    // perceptual group.
                    warn!(path = %path.display(), detail, "undecodable picture");
                    None
                }
                Err(e) => return Err(e),
            },
            MediaKind::Video => None,
        };

        let (group_id, _group_guards) = match &approx {
            Some(fp) => {
                let (id, guards) = self.resolve_group(fp)?;
                (Some(id), guards)
            }
            None => (None, Vec::new()),
        };

        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let destination = layout::destination(summary.capture_time.as_deref(), kind, &original_name);
        let hot_root = self.roots.root(Tier::Hot).clone();
        let rel_path = layout::place_original(path, &hot_root, &destination)?;

        let size_bytes = std::fs::metadata(path)
            .map(|m| m.len() as i64)
            .unwrap_or(0);

        let record_id = self.db.insert_record(&NewRecord {
            exact_fingerprint: hex.clone(),
            approx_fingerprint: approx.as_ref().map(|fp| fp.as_str().to_string()),
            media_kind: kind,
            size_bytes,
            storage_tier: Tier::Hot.as_str().to_string(),
            storage_path: rel_path.to_string_lossy().into_owned(),
            group_id,
            capture_time: summary.capture_time.clone(),
            gps_latitude: summary.gps_latitude,
            gps_longitude: summary.gps_longitude,
            gps_accuracy_m: summary.gps_accuracy_m,
            gps_recorded_at: summary.gps_recorded_at.clone(),
            device_make: summary.device_make.clone(),
            device_model: summary.device_model.clone(),
            device_os_version: summary.device_os_version.clone(),
        })?;

        if let Some(fp) = &approx {
            self.index.insert(fp, record_id, group_id)?;
        }

        self.db.add_source_tag(record_id, source_id, Some(&path.to_string_lossy()))?;
        let mut incoming = summary.to_metadata(source_id);
        incoming.extend(extra.clone());
        // Importer fields on a groupless record (video, undecodable picture)
        // still need a merge target.
        let group_id = match group_id {
            Some(id) => Some(id),
            None if !extra.is_empty() => {
                let id = self.db.create_group()?;
                self.db.set_group(record_id, id)?;
                Some(id)
            }
            None => None,
        };
        if let Some(group_id) = group_id {
            let merged = self.db.merge_into_group(group_id, &incoming, &self.policy)?;
            self.db.apply_reconciled_summary(record_id, &merged)?;
            self.sync.write_group_sidecars(group_id)?;
        } else {
            let record = self.db.record_by_id(record_id)?;
            self.sync.write_sidecar(&record)?;
        }
        self.db.add_history(
            record_id,
            "ingested",
            Some(&path.display().to_string()),
            Some(source_id),
        )?;

        info!(record = record_id, path = %path.display(), source = source_id, "stored");
        Ok(IngestOutcome::Stored { record_id })
    }

    /// Same bytes, new presentation: tag the source, fold in its metadata,
    /// refresh sidecars. No archive write.
    fn absorb_duplicate(
        &self,
        record_id: i64,
        path: &Path,
        source_id: &str,
        extra: &MetadataSet,
    ) -> Result<IngestOutcome> {
        self.db.add_source_tag(record_id, source_id, Some(&path.to_string_lossy()))?;

        let summary = exif::extract_capture_summary(path);
        let mut incoming = summary.to_metadata(source_id);
        incoming.extend(extra.clone());

        let record = self.db.record_by_id(record_id)?;
        let (group_id, _group_guard) = self.lock_record_group(record_id, record.group_id)?;
        if !incoming.is_empty() {
            let merged = self.db.merge_into_group(group_id, &incoming, &self.policy)?;
            self.db.apply_reconciled_summary(record_id, &merged)?;
        }
        self.db.add_history(
            record_id,
            "re-presented",
            Some(&path.display().to_string()),
            Some(source_id),
        )?;
        self.sync.write_group_sidecars(group_id)?;

        info!(record = record_id, source = source_id, "duplicate absorbed");
        Ok(IngestOutcome::Duplicate { record_id })
    }

    /// Maps a perceptual fingerprint onto a group: join the single match,
    /// union multiple matches (smallest id survives), or start fresh.
    ///
    /// The returned guards pin every involved group until the caller has
    /// committed its record, so a concurrent ingest cannot union a group
    /// away between resolution and insert.
    fn resolve_group(&self, fingerprint: &ApproxFingerprint) -> Result<(i64, Vec<KeyGuard>)> {
        loop {
            let neighbors = self
                .index
                .find_neighbors(fingerprint, self.options.similarity_threshold)?;
            let mut groups: Vec<i64> = neighbors.iter().filter_map(|n| n.group_id).collect();
            groups.sort_unstable();
            groups.dedup();

            if groups.is_empty() {
                let id = self.db.create_group()?;
                let guard = self
                    .locks
                    .acquire(&format!("group:{id}"), self.options.lock_timeout)?;
                return Ok((id, vec![guard]));
            }

            let keys: Vec<String> = groups.iter().map(|id| format!("group:{id}")).collect();
            let guards = self.locks.acquire_many(&keys, self.options.lock_timeout)?;

            // While we waited for the locks another worker may have unioned
            // a candidate away. Point the stale entries at the member's
            // current group and resolve again.
            let mut stale = false;
            for neighbor in &neighbors {
                let Some(group_id) = neighbor.group_id else { continue };
                if !self.db.group_exists(group_id)? {
                    if let Some(current) = self.db.record_by_id(neighbor.record_id)?.group_id {
                        self.index.retarget_group(group_id, current);
                    }
                    stale = true;
                }
            }
            if stale {
                continue;
            }

            if groups.len() == 1 {
                return Ok((groups[0], guards));
            }

            let mut survivor = groups[0];
            for other in &groups[1..] {
                let kept = self.db.union_groups(survivor, *other, &self.policy)?;
                let absorbed = if kept == survivor { *other } else { survivor };
                self.index.retarget_group(absorbed, kept);
                survivor = kept;
            }
            return Ok((survivor, guards));
        }
    }

    /// Pins a record's group before merging into it. The group can be
    /// unioned away while we wait for its lock, so re-read the membership
    /// until it holds still under the lock.
    fn lock_record_group(
        &self,
        record_id: i64,
        current: Option<i64>,
    ) -> Result<(i64, KeyGuard)> {
        let mut group_id = match current {
            Some(id) => id,
            None => {
                let id = self.db.create_group()?;
                self.db.set_group(record_id, id)?;
                id
            }
        };
        loop {
            let guard = self
                .locks
                .acquire(&format!("group:{group_id}"), self.options.lock_timeout)?;
            let now = self.db.record_by_id(record_id)?.group_id.unwrap_or(group_id);
            if now == group_id {
                return Ok((group_id, guard));
            }
            group_id = now;
        }
    }

    fn hash_with_retries(&self, path: &Path) -> Result<crate::identity::ExactFingerprint> {
        let mut attempt = 0;
        loop {
            match compute_exact(path) {
                Ok(fp) => return Ok(fp),
                Err(e) if e.is_retryable() && attempt < self.options.io_retries => {
                    attempt += 1;
                    warn!(path = %path.display(), attempt, error = %e, "read failed, retrying");
                    std::thread::sleep(self.options.retry_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Walks a directory and ingests every media file in parallel.
    pub fn batch_ingest(&self, root: &Path, source_id: &str) -> Result<BatchReport> {
        let files: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();

        info!(root = %root.display(), files = files.len(), source = source_id, "batch start");

        let outcomes: Vec<(PathBuf, Result<IngestOutcome>)> = files
            .into_par_iter()
            .map(|path| {
                let outcome = self.ingest_file(&path, source_id);
                (path, outcome)
            })
            .collect();

        let mut report = BatchReport::default();
        for (path, outcome) in outcomes {
            match outcome {
                Ok(IngestOutcome::Stored { .. }) => report.stored += 1,
                Ok(IngestOutcome::Duplicate { .. }) => report.duplicates += 1,
                Ok(IngestOutcome::SkippedUnsupported) => report.skipped += 1,
                Ok(IngestOutcome::Cancelled) => report.cancelled += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ingest failed");
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        info!(
            stored = report.stored,
            duplicates = report.duplicates,
            skipped = report.skipped,
            failed = report.failed.len(),
            "batch complete"
        );
        Ok(report)
    }
}
