//! Enrichment inputs: device verification and vision analysis.
//!
//! Both produce ordinary reconcilable fields attributed to their own
//! source ids, so their results flow through the same merge path as any
//! import. Vision person regions enter unconfirmed; only an external
//! assertion later upgrades them.

use image::DynamicImage;
use std::sync::Arc;
use tracing::info;

use crate::error::{ArchiveError, Result};
use crate::reconcile::{FieldValue, MetadataSet, ReconcilePolicy};
use crate::store::{Database, MediaRecord, Region};
use crate::tier::TierRoots;

pub const DEVICE_VERIFIER_SOURCE: &str = "device-verifier";
pub const VISION_SOURCE: &str = "vision";

/// Outcome of checking whether a file genuinely came from the device its
/// metadata claims. Confidence is 0..1 over the checked signals.
#[derive(Debug, Clone)]
pub struct DeviceVerification {
    pub make: Option<String>,
    pub model: Option<String>,
    pub os_version: Option<String>,
    /// Maker-note and vendor tag presence, the hardest signal to fake.
    pub vendor_tags_present: bool,
    pub confidence: f64,
}

impl DeviceVerification {
    pub fn to_metadata(&self) -> MetadataSet {
        let mut fields = MetadataSet::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                fields.insert(key.to_string(), FieldValue::new(value, DEVICE_VERIFIER_SOURCE));
            }
        };
        put("device.make", self.make.clone());
        put("device.model", self.model.clone());
        put("device.os_version", self.os_version.clone());
        put("device.vendor_tags", Some(self.vendor_tags_present.to_string()));
        put("device.confidence", Some(format!("{:.2}", self.confidence)));
        fields
    }
}

/// A face region proposed by a classifier, not yet confirmed by anyone.
#[derive(Debug, Clone)]
pub struct DetectedRegion {
    pub person_name: String,
    pub region: Region,
    pub confidence: f64,
}

/// Vision analysis output for one record.
#[derive(Debug, Clone, Default)]
pub struct VisionEnrichment {
    pub quality_score: Option<f64>,
    pub caption: Option<String>,
    pub tags: Vec<String>,
    pub regions: Vec<DetectedRegion>,
}

impl VisionEnrichment {
    pub fn to_metadata(&self) -> MetadataSet {
        let mut fields = MetadataSet::new();
        if let Some(caption) = &self.caption {
            fields.insert(
                "caption".to_string(),
                FieldValue::new(caption.clone(), VISION_SOURCE),
            );
        }
        if !self.tags.is_empty() {
            let mut tags = self.tags.clone();
            tags.sort();
            tags.dedup();
            if let Ok(json) = serde_json::to_string(&tags) {
                fields.insert("keywords".to_string(), FieldValue::new(json, VISION_SOURCE));
            }
        }
        fields
    }
}

/// Decodes a record's stored payload for analysis. The caller never
/// touches tier paths directly.
pub fn decoded_pixels(
    db: &Database,
    roots: &TierRoots,
    exact_fingerprint: &str,
) -> Result<DynamicImage> {
    let record = db
        .record_by_fingerprint(exact_fingerprint)?
        .ok_or_else(|| ArchiveError::RecordNotFound(exact_fingerprint.to_string()))?;
    let path = roots.absolute(&record)?;
    image::open(&path)
        .map_err(|e| ArchiveError::unsupported(&path, format!("decode failed: {e}")))
}

/// Applies an enrichment result to a record: fields through the group
/// reconciler, regions as unconfirmed annotations.
pub fn apply_enrichment(
    db: &Arc<Database>,
    record: &MediaRecord,
    policy: &ReconcilePolicy,
    device: Option<&DeviceVerification>,
    vision: Option<&VisionEnrichment>,
) -> Result<()> {
    let mut incoming = MetadataSet::new();
    if let Some(device) = device {
        incoming.append(&mut device.to_metadata());
    }
    if let Some(vision) = vision {
        incoming.append(&mut vision.to_metadata());
    }

    if !incoming.is_empty() {
        let group_id = match record.group_id {
            Some(group_id) => group_id,
            None => {
                let group_id = db.create_group()?;
                db.set_group(record.id, group_id)?;
                group_id
            }
        };
        db.merge_into_group(group_id, &incoming, policy)?;
    }

    if let Some(vision) = vision {
        if let Some(score) = vision.quality_score {
            db.set_quality_score(record.id, score)?;
        }
        for detected in &vision.regions {
            let person = db.find_or_create_person(&detected.person_name)?;
            db.upsert_person_annotation(
                record.id,
                person.id,
                detected.region,
                Some(detected.confidence),
                None,
            )?;
        }
        if !vision.regions.is_empty() {
            info!(
                record = record.id,
                regions = vision.regions.len(),
                "vision regions recorded as unconfirmed"
            );
        }
    }

    db.add_history(
        record.id,
        "enriched",
        None,
        Some(if device.is_some() { DEVICE_VERIFIER_SOURCE } else { VISION_SOURCE }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MediaKind, NewRecord};

    fn seed(db: &Database, fingerprint: &str) -> MediaRecord {
        let id = db
            .insert_record(&NewRecord {
                exact_fingerprint: fingerprint.to_string(),
                approx_fingerprint: None,
                media_kind: MediaKind::Picture,
                size_bytes: 10,
                storage_tier: "hot".to_string(),
                storage_path: "unknown/pictures/x.jpg".to_string(),
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
        db.record_by_id(id).unwrap()
    }

    #[test]
    fn device_fields_attributed_to_verifier() {
        let verification = DeviceVerification {
            make: Some("Apple".to_string()),
            model: Some("iPhone 14 Pro".to_string()),
            os_version: None,
            vendor_tags_present: true,
            confidence: 0.95,
        };
        let fields = verification.to_metadata();
        assert_eq!(fields["device.make"].source, DEVICE_VERIFIER_SOURCE);
        assert_eq!(fields["device.confidence"].value, "0.95");
        assert!(!fields.contains_key("device.os_version"));
    }

    #[test]
    fn vision_regions_enter_unconfirmed() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let record = seed(&db, &"aa".repeat(32));
        let policy = Config::default().reconcile_policy();

        let vision = VisionEnrichment {
            quality_score: Some(0.85),
            caption: Some("two people on a beach".to_string()),
            tags: vec!["beach".to_string(), "people".to_string()],
            regions: vec![DetectedRegion {
                person_name: "Alice".to_string(),
                region: Region { x: 0.3, y: 0.4, w: 0.15, h: 0.2 },
                confidence: 0.72,
            }],
        };
        apply_enrichment(&db, &record, &policy, None, Some(&vision)).unwrap();

        let annotations = db.annotations_for(record.id).unwrap();
        assert_eq!(annotations.len(), 1);
        assert!(!annotations[0].is_confirmed());
        assert!(!db.has_confirmed_person(record.id).unwrap());

        let record = db.record_by_id(record.id).unwrap();
        assert_eq!(record.quality_score, Some(0.85));
        let fields = db.merged_fields(record.id).unwrap();
        assert_eq!(fields["caption"].source, VISION_SOURCE);
        assert_eq!(fields["keywords"].value, r#"["beach","people"]"#);
    }

    #[test]
    fn vision_keywords_union_with_imported_ones() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let record = seed(&db, &"bb".repeat(32));
        let policy = Config::default().reconcile_policy();

        let group = db.create_group().unwrap();
        db.set_group(record.id, group).unwrap();
        let mut imported = MetadataSet::new();
        imported.insert(
            "keywords".to_string(),
            FieldValue::new(r#"["family"]"#, "icloud"),
        );
        db.merge_into_group(group, &imported, &policy).unwrap();

        let record = db.record_by_id(record.id).unwrap();
        let vision = VisionEnrichment {
            tags: vec!["beach".to_string()],
            ..Default::default()
        };
        apply_enrichment(&db, &record, &policy, None, Some(&vision)).unwrap();

        let fields = db.merged_fields(record.id).unwrap();
        assert_eq!(fields["keywords"].value, r#"["beach","family"]"#);
        assert_eq!(fields["keywords"].source, "icloud+vision");
    }
}
