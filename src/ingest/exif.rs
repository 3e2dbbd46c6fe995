//! EXIF extraction for incoming files.
//!
//! Extraction is best effort throughout: a file with unreadable or missing
//! EXIF still ingests, it just lands in the `unknown/` bucket with an empty
//! field set.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::reconcile::{FieldValue, MetadataSet};

#[derive(Debug, Clone, Default)]
pub struct CaptureSummary {
    pub capture_time: Option<String>,

    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    /// GPSHPositioningError, meters.
    pub gps_accuracy_m: Option<f64>,
    /// GPS receiver's own date/time stamp, distinct from capture time.
    pub gps_recorded_at: Option<String>,

    pub device_make: Option<String>,
    pub device_model: Option<String>,
    pub device_os_version: Option<String>,
}

impl CaptureSummary {
    /// Projects the summary into reconcilable fields attributed to the
    /// presenting source.
    pub fn to_metadata(&self, source: &str) -> MetadataSet {
        let mut fields = MetadataSet::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                fields.insert(key.to_string(), FieldValue::new(value, source));
            }
        };
        put("capture.time", self.capture_time.clone());
        put("gps.latitude", self.gps_latitude.map(|v| v.to_string()));
        put("gps.longitude", self.gps_longitude.map(|v| v.to_string()));
        put("gps.accuracy_m", self.gps_accuracy_m.map(|v| v.to_string()));
        put("gps.timestamp", self.gps_recorded_at.clone());
        put("device.make", self.device_make.clone());
        put("device.model", self.device_model.clone());
        put("device.os_version", self.device_os_version.clone());
        fields
    }
}

fn display_string(field: &exif::Field) -> String {
    field.display_value().to_string().trim_matches('"').to_string()
}

fn first_rational(field: &exif::Field) -> Option<f64> {
    if let exif::Value::Rational(ref v) = field.value {
        v.first().map(|r| r.num as f64 / r.denom as f64)
    } else {
        None
    }
}

pub fn extract_capture_summary(path: &Path) -> CaptureSummary {
    let mut summary = CaptureSummary::default();

    let Ok(file) = File::open(path) else {
        return summary;
    };
    let mut bufreader = BufReader::new(file);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) else {
        return summary;
    };

    if let Some(field) = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY) {
        summary.capture_time = Some(display_string(field));
    } else if let Some(field) = exif.get_field(exif::Tag::DateTime, exif::In::PRIMARY) {
        summary.capture_time = Some(display_string(field));
    }

    if let Some(field) = exif.get_field(exif::Tag::Make, exif::In::PRIMARY) {
        summary.device_make = Some(display_string(field));
    }
    if let Some(field) = exif.get_field(exif::Tag::Model, exif::In::PRIMARY) {
        summary.device_model = Some(display_string(field));
    }
    // Phone cameras report the OS build in Software.
    if let Some(field) = exif.get_field(exif::Tag::Software, exif::In::PRIMARY) {
        summary.device_os_version = Some(display_string(field));
    }

    if let (Some(lat_field), Some(lat_ref), Some(lon_field), Some(lon_ref)) = (
        exif.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY),
        exif.get_field(exif::Tag::GPSLatitudeRef, exif::In::PRIMARY),
        exif.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY),
        exif.get_field(exif::Tag::GPSLongitudeRef, exif::In::PRIMARY),
    ) {
        if let (exif::Value::Rational(lat_vals), exif::Value::Rational(lon_vals)) =
            (&lat_field.value, &lon_field.value)
        {
            if lat_vals.len() >= 3 && lon_vals.len() >= 3 {
                let lat = dms_to_decimal(
                    lat_vals[0].num as f64 / lat_vals[0].denom as f64,
                    lat_vals[1].num as f64 / lat_vals[1].denom as f64,
                    lat_vals[2].num as f64 / lat_vals[2].denom as f64,
                );
                let lon = dms_to_decimal(
                    lon_vals[0].num as f64 / lon_vals[0].denom as f64,
                    lon_vals[1].num as f64 / lon_vals[1].denom as f64,
                    lon_vals[2].num as f64 / lon_vals[2].denom as f64,
                );

                let lat_ref_str = lat_ref.display_value().to_string();
                let lon_ref_str = lon_ref.display_value().to_string();

                summary.gps_latitude = Some(if lat_ref_str.contains('S') { -lat } else { lat });
                summary.gps_longitude = Some(if lon_ref_str.contains('W') { -lon } else { lon });
            }
        }
    }

    if let Some(field) = exif.get_field(exif::Tag::GPSHPositioningError, exif::In::PRIMARY) {
        summary.gps_accuracy_m = first_rational(field);
    }

    // The GPS receiver's own timestamp, often a few seconds off the camera
    // clock. Kept separately so the reconciler can prefer one source for it.
    if let (Some(date), Some(time)) = (
        exif.get_field(exif::Tag::GPSDateStamp, exif::In::PRIMARY),
        exif.get_field(exif::Tag::GPSTimeStamp, exif::In::PRIMARY),
    ) {
        summary.gps_recorded_at =
            Some(format!("{} {}", display_string(date), display_string(time)));
    }

    summary
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}
