use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::Result as ArchiveResult;
use crate::reconcile::{FieldPolicy, ReconcilePolicy};
use crate::tier::{TierPolicy, TierRoots};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub tier: TierConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// Storage roots for the three tiers. Each holds the same deterministic
/// date-derived layout; a record's relative path is identical in every tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_hot_root")]
    pub hot_root: PathBuf,

    #[serde(default = "default_warm_root")]
    pub warm_root: PathBuf,

    #[serde(default = "default_cold_root")]
    pub cold_root: PathBuf,
}

fn default_hot_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("photark/hot")
}

fn default_warm_root() -> PathBuf {
    PathBuf::from("/mnt/nas/photos/active")
}

fn default_cold_root() -> PathBuf {
    PathBuf::from("/mnt/nas/photos/archive")
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            hot_root: default_hot_root(),
            warm_root: default_warm_root(),
            cold_root: default_cold_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_picture_extensions")]
    pub picture_extensions: Vec<String>,

    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: u32,
}

fn default_picture_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "heic", "heif", "raw", "cr2", "nef", "arw", "dng", "gif", "bmp",
        "tiff", "webp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "mov", "m4v", "hevc", "avi", "mkv", "webm", "3gp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_similarity_threshold() -> u32 {
    10 // Hamming distance on the 256-bit gradient hash. Re-encoding and
       // metadata stripping land well under this; distinct photos land far
       // above it. Recalibrate against a labeled corpus before raising.
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            picture_extensions: default_picture_extensions(),
            video_extensions: default_video_extensions(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Bounded retry count for unreadable sources before the file is
    /// skipped (the batch continues).
    #[serde(default = "default_io_retries")]
    pub io_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Bound on acquiring a per-fingerprint or per-group exclusive section.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_io_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            io_retries: default_io_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(default = "default_hot_max_age_days")]
    pub hot_max_age_days: u32,

    #[serde(default = "default_warm_max_age_days")]
    pub warm_max_age_days: u32,

    /// Records at or above this quality score stay pinned in their tier.
    #[serde(default = "default_pin_quality_score")]
    pub pin_quality_score: f64,

    /// Warm records accessed within this window are not demoted to cold.
    #[serde(default = "default_recent_access_days")]
    pub recent_access_days: u32,

    /// Daemon maintenance pass interval.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

fn default_hot_max_age_days() -> u32 {
    90
}

fn default_warm_max_age_days() -> u32 {
    730
}

fn default_pin_quality_score() -> f64 {
    0.8
}

fn default_recent_access_days() -> u32 {
    30
}

fn default_maintenance_interval_secs() -> u64 {
    3600
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_max_age_days: default_hot_max_age_days(),
            warm_max_age_days: default_warm_max_age_days(),
            pin_quality_score: default_pin_quality_score(),
            recent_access_days: default_recent_access_days(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Known import sources. `PreferSource` policies must name one of these.
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,

    /// Declared fidelity order, highest first. Resolves `PreferNonNull`
    /// collisions.
    #[serde(default = "default_source_fidelity")]
    pub source_fidelity: Vec<String>,

    /// Per-field policy table. Keys match exactly or by dotted prefix.
    #[serde(default = "default_field_policies")]
    pub fields: BTreeMap<String, FieldPolicy>,
}

fn default_sources() -> Vec<String> {
    [
        "icloud",
        "digikam",
        "immich",
        "photoprism",
        "sidecar",
        "device-verifier",
        "vision",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_source_fidelity() -> Vec<String> {
    // iCloud originals carry the fullest EXIF; tools further down re-encode
    // or strip. Sidecar edits and external classifiers rank below imports
    // for plain field conflicts (person-region confirmation is handled by
    // the synchronizer's own rule, not fidelity).
    default_sources()
}

fn default_field_policies() -> BTreeMap<String, FieldPolicy> {
    let mut fields = BTreeMap::new();
    fields.insert("keywords".to_string(), FieldPolicy::UnionSet);
    fields.insert("tags".to_string(), FieldPolicy::UnionSet);
    fields.insert(
        "gps.timestamp".to_string(),
        FieldPolicy::PreferSource("icloud".to_string()),
    );
    fields.insert("processing".to_string(), FieldPolicy::KeepBothTagged);
    fields
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            source_fidelity: default_source_fidelity(),
            fields: default_field_policies(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photark")
        .join("photark.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            archive: ArchiveConfig::default(),
            scanner: ScannerConfig::default(),
            ingest: IngestConfig::default(),
            tier: TierConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photark")
            .join("config.toml")
    }

    /// Startup validation. Reconcile policy misconfiguration is fatal here,
    /// never a silent per-file default at runtime.
    pub fn validate(&self) -> ArchiveResult<()> {
        self.reconcile_policy().validate(&self.reconcile.sources)
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy::new(
            self.reconcile.fields.clone(),
            self.reconcile.source_fidelity.clone(),
        )
    }

    pub fn tier_roots(&self) -> TierRoots {
        TierRoots::new(
            self.archive.hot_root.clone(),
            self.archive.warm_root.clone(),
            self.archive.cold_root.clone(),
        )
    }

    pub fn tier_policy(&self) -> TierPolicy {
        TierPolicy {
            hot_max_age_days: self.tier.hot_max_age_days,
            warm_max_age_days: self.tier.warm_max_age_days,
            pin_quality_score: self.tier.pin_quality_score,
            recent_access_days: self.tier.recent_access_days,
        }
    }
}
