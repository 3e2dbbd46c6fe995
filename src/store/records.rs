//! Row types for the archive database.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Picture,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Picture => "picture",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "picture" => Some(MediaKind::Picture),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaRecord {
    pub id: i64,
    pub exact_fingerprint: String,
    pub approx_fingerprint: Option<String>,
    pub media_kind: MediaKind,
    pub size_bytes: i64,
    pub storage_tier: String,
    pub storage_path: String,
    pub group_id: Option<i64>,
    pub capture_time: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub gps_accuracy_m: Option<f64>,
    pub gps_recorded_at: Option<String>,
    pub device_make: Option<String>,
    pub device_model: Option<String>,
    pub device_os_version: Option<String>,
    pub quality_score: Option<f64>,
    pub tombstoned: bool,
    pub sidecar_stamp: Option<String>,
    pub sidecar_version: i64,
    pub first_seen_at: String,
    pub last_accessed_at: Option<String>,
}

/// What the ingestor knows about a file before it becomes a record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub exact_fingerprint: String,
    pub approx_fingerprint: Option<String>,
    pub media_kind: MediaKind,
    pub size_bytes: i64,
    pub storage_tier: String,
    pub storage_path: String,
    pub group_id: Option<i64>,
    pub capture_time: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub gps_accuracy_m: Option<f64>,
    pub gps_recorded_at: Option<String>,
    pub device_make: Option<String>,
    pub device_model: Option<String>,
    pub device_os_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub birthdate: Option<String>,
    pub verified: bool,
}

impl Person {
    /// Whole years old at a capture timestamp, when a birthdate is known.
    /// Accepts the exif timestamp form and ISO dates.
    pub fn age_at(&self, capture_time: &str) -> Option<u32> {
        let birth = NaiveDate::parse_from_str(self.birthdate.as_deref()?, "%Y-%m-%d").ok()?;
        let captured = parse_capture_date(capture_time)?;
        if captured < birth {
            return None;
        }
        let mut years = captured.year() - birth.year();
        if (captured.month(), captured.day()) < (birth.month(), birth.day()) {
            years -= 1;
        }
        u32::try_from(years).ok()
    }
}

fn parse_capture_date(raw: &str) -> Option<NaiveDate> {
    NaiveDateTime::parse_from_str(raw, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map(|dt| dt.date())
        .ok()
        .or_else(|| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
}

/// Normalized face region: center coordinates plus extent, all 0..1
/// relative to the decoded image, orientation applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Region {
    /// Two regions refer to the same face when their centers are closer
    /// than half the sum of their extents on both axes.
    pub fn overlaps(&self, other: &Region) -> bool {
        (self.x - other.x).abs() < (self.w + other.w) / 2.0
            && (self.y - other.y).abs() < (self.h + other.h) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct PersonAnnotation {
    pub id: i64,
    pub record_id: i64,
    pub person_id: i64,
    pub person_name: String,
    pub region: Region,
    pub confidence: Option<f64>,
    pub verifying_actor: Option<String>,
}

impl PersonAnnotation {
    pub fn is_confirmed(&self) -> bool {
        self.verifying_actor.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub action: String,
    pub detail: Option<String>,
    pub source_id: Option<String>,
    pub occurred_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_overlap_uses_center_distance() {
        let a = Region { x: 0.5, y: 0.5, w: 0.2, h: 0.2 };
        let b = Region { x: 0.55, y: 0.52, w: 0.2, h: 0.2 };
        let c = Region { x: 0.9, y: 0.9, w: 0.1, h: 0.1 };
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn age_at_capture_counts_whole_years() {
        let person = Person {
            id: 1,
            name: "Emma".to_string(),
            birthdate: Some("2015-06-10".to_string()),
            verified: true,
        };
        assert_eq!(person.age_at("2024:06:09 12:00:00"), Some(8));
        assert_eq!(person.age_at("2024:06:10 00:00:01"), Some(9));
        assert_eq!(person.age_at("2024-07-01"), Some(9));
        assert_eq!(person.age_at("2014-01-01"), None);
        assert_eq!(person.age_at("not a date"), None);

        let unknown = Person { birthdate: None, ..person };
        assert_eq!(unknown.age_at("2024:06:10 00:00:01"), None);
    }

    #[test]
    fn media_kind_round_trips() {
        assert_eq!(MediaKind::parse("picture"), Some(MediaKind::Picture));
        assert_eq!(MediaKind::parse(MediaKind::Video.as_str()), Some(MediaKind::Video));
        assert_eq!(MediaKind::parse("document"), None);
    }
}
