//! Sidecar documents.
//!
//! Each archived payload gets a JSON sidecar next to it named by appending
//! `.json` to the full filename (`sunset.jpg` -> `sunset.jpg.json`). The
//! sidecar is the externally editable projection of the record: reconciled
//! fields, keywords, face regions, provenance.
//!
//! Self-authored writes carry a stamp, the content hash of the document
//! with the stamp field cleared. The synchronizer compares an incoming
//! file's stamp against the one it last recorded to tell its own writes
//! apart from external edits.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};

pub const SIDECAR_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarDocument {
    pub version: i64,

    /// Content hash of this document with the stamp cleared. Absent in
    /// hand-written sidecars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamp: Option<String>,

    pub provenance: Provenance,

    /// Reconciled scalar fields, keyed by field name.
    #[serde(default)]
    pub fields: BTreeMap<String, SidecarField>,

    #[serde(default)]
    pub keywords: Vec<String>,

    /// MWG-style face regions, normalized center + extent.
    #[serde(default)]
    pub region_list: Vec<SidecarRegion>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,

    #[serde(default)]
    pub processing_history: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub exact_fingerprint: String,

    #[serde(default)]
    pub source_tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_verification: Option<DeviceBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarField {
    pub value: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarRegion {
    pub name: String,

    #[serde(rename = "type")]
    pub region_type: String,

    pub area: RegionArea,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Who confirmed this region. Absent means an unconfirmed classifier
    /// guess.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifying_actor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionArea {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl SidecarDocument {
    /// Stamp of the document's content, computed with the stamp field
    /// cleared so the hash covers only the payload.
    pub fn compute_stamp(&self) -> Result<String> {
        let mut unstamped = self.clone();
        unstamped.stamp = None;
        let bytes = serde_json::to_vec(&unstamped).map_err(|e| {
            ArchiveError::MalformedSidecar { path: PathBuf::new(), source: e }
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Ok(hex)
    }

    /// Fills in the stamp field, returning the stamp value.
    pub fn finalize(&mut self) -> Result<String> {
        let stamp = self.compute_stamp()?;
        self.stamp = Some(stamp.clone());
        Ok(stamp)
    }
}

/// `sunset.jpg` -> `sunset.jpg.json`. The media extension stays visible so
/// a directory listing pairs them up.
pub fn sidecar_path(media_path: &Path) -> PathBuf {
    let mut name = media_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(SIDECAR_EXTENSION);
    media_path.with_file_name(name)
}

/// The media path a sidecar describes, if the name fits the convention.
pub fn media_path_for(sidecar: &Path) -> Option<PathBuf> {
    let name = sidecar.file_name()?.to_str()?;
    let media_name = name.strip_suffix(".json")?;
    if media_name.is_empty() {
        return None;
    }
    Some(sidecar.with_file_name(media_name))
}

/// Atomic write: temp file in the same directory, fsync, rename over the
/// target, then fsync the directory. Readers never observe a torn sidecar.
pub fn write_document(path: &Path, document: &SidecarDocument) -> Result<()> {
    let json = serde_json::to_vec_pretty(document).map_err(|e| {
        ArchiveError::MalformedSidecar { path: path.to_path_buf(), source: e }
    })?;

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&parent).map_err(|e| ArchiveError::io(&parent, e))?;

    let temp = path.with_extension("json.tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&temp).map_err(|e| ArchiveError::io(&temp, e))?;
        file.write_all(&json).map_err(|e| ArchiveError::io(&temp, e))?;
        file.sync_all().map_err(|e| ArchiveError::io(&temp, e))?;
    }
    std::fs::rename(&temp, path).map_err(|e| ArchiveError::io(path, e))?;

    #[cfg(unix)]
    if let Ok(dir) = std::fs::File::open(&parent) {
        let _ = dir.sync_all();
    }

    // Round-trip check: what landed on disk parses back to what we wrote.
    let reread = load_document(path)?;
    if &reread != document {
        return Err(ArchiveError::IntegrityViolation {
            path: path.to_path_buf(),
            expected: "sidecar round-trip".to_string(),
            actual: "reread document differs".to_string(),
        });
    }
    Ok(())
}

pub fn load_document(path: &Path) -> Result<SidecarDocument> {
    let content = std::fs::read_to_string(path).map_err(|e| ArchiveError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| ArchiveError::MalformedSidecar { path: path.to_path_buf(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SidecarDocument {
        SidecarDocument {
            version: 1,
            stamp: None,
            provenance: Provenance {
                exact_fingerprint: "ab".repeat(32),
                source_tags: vec!["icloud".to_string()],
                device_verification: Some(DeviceBlock {
                    make: Some("Apple".to_string()),
                    model: Some("iPhone 14 Pro".to_string()),
                    os_version: Some("17.1".to_string()),
                    confidence: 0.95,
                }),
            },
            fields: BTreeMap::from([(
                "caption".to_string(),
                SidecarField { value: "the pier".to_string(), source: "icloud".to_string() },
            )]),
            keywords: vec!["beach".to_string(), "sunset".to_string()],
            region_list: vec![SidecarRegion {
                name: "Alice".to_string(),
                region_type: "Face".to_string(),
                area: RegionArea { x: 0.5, y: 0.4, w: 0.2, h: 0.25 },
                confidence: Some(0.9),
                verifying_actor: None,
            }],
            quality_score: Some(0.7),
            processing_history: vec!["ingested".to_string()],
        }
    }

    #[test]
    fn stamp_ignores_existing_stamp_field() {
        let mut doc = sample();
        let first = doc.finalize().unwrap();
        // Stamping again over the already-stamped document is stable.
        let second = doc.compute_stamp().unwrap();
        assert_eq!(first, second);
        assert_eq!(doc.stamp.as_deref(), Some(first.as_str()));
    }

    #[test]
    fn stamp_changes_with_content() {
        let doc = sample();
        let mut edited = sample();
        edited.keywords.push("family".to_string());
        assert_ne!(doc.compute_stamp().unwrap(), edited.compute_stamp().unwrap());
    }

    #[test]
    fn path_convention_keeps_media_extension() {
        let media = Path::new("/archive/2024/2024-03/pictures/sunset.jpg");
        let sidecar = sidecar_path(media);
        assert_eq!(
            sidecar,
            PathBuf::from("/archive/2024/2024-03/pictures/sunset.jpg.json")
        );
        assert_eq!(media_path_for(&sidecar), Some(media.to_path_buf()));
        assert_eq!(media_path_for(Path::new("/a/.json")), None);
        assert_eq!(media_path_for(Path::new("/a/readme.txt")), None);
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sunset.jpg.json");

        let mut doc = sample();
        doc.finalize().unwrap();
        write_document(&path, &doc).unwrap();

        let loaded = load_document(&path).unwrap();
        assert_eq!(loaded, doc);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn malformed_sidecar_is_reported_not_panicked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_document(&path).unwrap_err();
        assert!(matches!(err, ArchiveError::MalformedSidecar { .. }));
    }

    #[test]
    fn serialized_keys_are_camel_case() {
        let mut doc = sample();
        doc.finalize().unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"exactFingerprint\""));
        assert!(json.contains("\"regionList\""));
        assert!(json.contains("\"type\":\"Face\""));
        assert!(!json.contains("\"region_list\""));
    }
}
