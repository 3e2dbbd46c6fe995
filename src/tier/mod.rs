//! Storage tier lifecycle.
//!
//! Records age from hot to warm to cold. Every move is copy, verify,
//! re-lock, then delete; the byte payload is never altered in transit and
//! a hash mismatch aborts the move with the source intact.

use chrono::{NaiveDateTime, Utc};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ArchiveError, Result};
use crate::identity::{compute_exact, ExactFingerprint};
use crate::layout;
use crate::store::{Database, MediaRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            other => Err(ArchiveError::InvalidValue {
                what: "tier",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierRoots {
    hot: PathBuf,
    warm: PathBuf,
    cold: PathBuf,
}

impl TierRoots {
    pub fn new(hot: PathBuf, warm: PathBuf, cold: PathBuf) -> Self {
        Self { hot, warm, cold }
    }

    pub fn root(&self, tier: Tier) -> &PathBuf {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    /// Absolute payload path for a record's current locator.
    pub fn absolute(&self, record: &MediaRecord) -> Result<PathBuf> {
        let tier = Tier::from_str(&record.storage_tier)?;
        Ok(self.root(tier).join(&record.storage_path))
    }
}

#[derive(Debug, Clone)]
pub struct TierPolicy {
    pub hot_max_age_days: u32,
    pub warm_max_age_days: u32,
    pub pin_quality_score: f64,
    pub recent_access_days: u32,
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub demoted_to_warm: usize,
    pub demoted_to_cold: usize,
    pub failed: usize,
}

pub struct TierManager {
    db: Arc<Database>,
    roots: TierRoots,
    policy: TierPolicy,
}

/// Best effort: the sidecar follows its payload, but it is re-renderable
/// from the database, so a failed move is only logged.
fn move_sidecar(old_media: &std::path::Path, new_media: &std::path::Path) {
    let old = crate::sidecar::sidecar_path(old_media);
    if !old.exists() {
        return;
    }
    let new = crate::sidecar::sidecar_path(new_media);
    if let Err(e) = std::fs::copy(&old, &new).and_then(|_| std::fs::remove_file(&old)) {
        warn!(from = %old.display(), error = %e, "sidecar did not follow payload");
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

fn age_days(raw: &str) -> Option<i64> {
    let then = parse_timestamp(raw)?;
    Some((Utc::now().naive_utc() - then).num_days())
}

impl TierManager {
    pub fn new(db: Arc<Database>, roots: TierRoots, policy: TierPolicy) -> Self {
        Self { db, roots, policy }
    }

    pub fn roots(&self) -> &TierRoots {
        &self.roots
    }

    /// One demotion pass over the hot and warm tiers.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        for record in self.db.records_in_tier(Tier::Hot.as_str())? {
            if self.should_demote(&record, Tier::Hot)? {
                match self.demote(&record, Tier::Warm) {
                    Ok(()) => report.demoted_to_warm += 1,
                    Err(e) => {
                        warn!(record = record.id, error = %e, "demotion to warm failed");
                        report.failed += 1;
                    }
                }
            }
        }

        for record in self.db.records_in_tier(Tier::Warm.as_str())? {
            if self.should_demote(&record, Tier::Warm)? {
                match self.demote(&record, Tier::Cold) {
                    Ok(()) => report.demoted_to_cold += 1,
                    Err(e) => {
                        warn!(record = record.id, error = %e, "demotion to cold failed");
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            to_warm = report.demoted_to_warm,
            to_cold = report.demoted_to_cold,
            failed = report.failed,
            "tier maintenance pass complete"
        );
        Ok(report)
    }

    /// Age-based demotion, overridden by pins: a high quality score or a
    /// confirmed person keeps a record where it is. Recently fetched warm
    /// records also stay put.
    pub fn should_demote(&self, record: &MediaRecord, from: Tier) -> Result<bool> {
        if let Some(score) = record.quality_score {
            if score >= self.policy.pin_quality_score {
                return Ok(false);
            }
        }
        if self.db.has_confirmed_person(record.id)? {
            return Ok(false);
        }

        let reference = record.capture_time.as_deref().unwrap_or(&record.first_seen_at);
        let Some(age) = age_days(reference) else {
            return Ok(false);
        };

        match from {
            Tier::Hot => Ok(age > self.policy.hot_max_age_days as i64),
            Tier::Warm => {
                if let Some(accessed) = record.last_accessed_at.as_deref() {
                    if let Some(access_age) = age_days(accessed) {
                        if access_age <= self.policy.recent_access_days as i64 {
                            return Ok(false);
                        }
                    }
                }
                Ok(age > self.policy.warm_max_age_days as i64)
            }
            Tier::Cold => Ok(false),
        }
    }

    /// Moves a record's payload to `target`. The relative path is the same
    /// under every root, so only the tier column changes on success.
    pub fn demote(&self, record: &MediaRecord, target: Tier) -> Result<()> {
        let from_tier = Tier::from_str(&record.storage_tier)?;
        let source = self.roots.root(from_tier).join(&record.storage_path);
        let destination = self.roots.root(target).join(&record.storage_path);

        self.transfer(record, &source, &destination)?;
        std::fs::remove_file(&source).map_err(|e| ArchiveError::io(&source, e))?;
        move_sidecar(&source, &destination);

        self.db.set_storage(record.id, target.as_str(), &record.storage_path)?;
        self.db.add_history(
            record.id,
            "demoted",
            Some(&format!("{from_tier} -> {target}")),
            None,
        )?;
        info!(record = record.id, from = %from_tier, to = %target, "demoted");
        Ok(())
    }

    /// Retrieves a record's payload path for reading. Cold records are
    /// promoted to warm first; the call blocks until the verified copy
    /// exists. Updates the access time that pins warm records.
    pub fn fetch(&self, fingerprint: &ExactFingerprint) -> Result<PathBuf> {
        let hex = fingerprint.to_hex();
        let record = self
            .db
            .record_by_fingerprint(&hex)?
            .ok_or_else(|| ArchiveError::RecordNotFound(hex.clone()))?;

        let tier = Tier::from_str(&record.storage_tier)?;
        let path = if tier == Tier::Cold {
            self.promote(&record)?
        } else {
            let path = self.roots.absolute(&record)?;
            if !path.exists() {
                return Err(ArchiveError::IntegrityViolation {
                    path: path.clone(),
                    expected: hex,
                    actual: "payload missing".to_string(),
                });
            }
            path
        };

        self.db.touch_last_accessed(record.id)?;
        Ok(path)
    }

    fn promote(&self, record: &MediaRecord) -> Result<PathBuf> {
        let source = self.roots.root(Tier::Cold).join(&record.storage_path);
        let destination = self.roots.root(Tier::Warm).join(&record.storage_path);

        self.transfer(record, &source, &destination)?;
        std::fs::remove_file(&source).map_err(|e| ArchiveError::io(&source, e))?;
        move_sidecar(&source, &destination);

        self.db.set_storage(record.id, Tier::Warm.as_str(), &record.storage_path)?;
        self.db.add_history(record.id, "promoted", Some("cold -> warm"), None)?;
        info!(record = record.id, "promoted from cold");
        Ok(destination)
    }

    /// Copy then verify. The destination only becomes authoritative after
    /// its hash matches the record's exact fingerprint.
    fn transfer(
        &self,
        record: &MediaRecord,
        source: &std::path::Path,
        destination: &std::path::Path,
    ) -> Result<()> {
        if !source.exists() {
            return Err(ArchiveError::IntegrityViolation {
                path: source.to_path_buf(),
                expected: record.exact_fingerprint.clone(),
                actual: "payload missing".to_string(),
            });
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }
        std::fs::copy(source, destination).map_err(|e| ArchiveError::io(source, e))?;

        let actual = compute_exact(destination)?;
        if actual.to_hex() != record.exact_fingerprint {
            let _ = std::fs::remove_file(destination);
            return Err(ArchiveError::IntegrityViolation {
                path: destination.to_path_buf(),
                expected: record.exact_fingerprint.clone(),
                actual: actual.to_hex(),
            });
        }

        layout::mark_read_only(destination)?;
        Ok(())
    }

    /// Verifies the stored payload still matches its fingerprint.
    pub fn verify(&self, record: &MediaRecord) -> Result<()> {
        let path = self.roots.absolute(record)?;
        let actual = compute_exact(&path)?;
        if actual.to_hex() != record.exact_fingerprint {
            return Err(ArchiveError::IntegrityViolation {
                path,
                expected: record.exact_fingerprint.clone(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}
