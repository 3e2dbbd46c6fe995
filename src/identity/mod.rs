//! Content identity: exact and perceptual fingerprints.
//!
//! The exact fingerprint is a SHA-256 over the complete file bytes and is the
//! primary identity of a stored artifact: a single flipped bit anywhere,
//! metadata included, yields an unrelated digest. The approximate fingerprint
//! is a 256-bit gradient (difference) hash computed from decoded,
//! orientation-normalized pixels only, so re-encoding or metadata stripping
//! moves it by at most a few bits.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use crate::error::{ArchiveError, Result};

/// 256-bit cryptographic digest of complete file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExactFingerprint([u8; 32]);

impl ExactFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl fmt::Display for ExactFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ExactFingerprint {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(ArchiveError::InvalidValue {
                what: "fingerprint",
                value: s.to_string(),
            });
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => bytes[i] = b,
                None => {
                    return Err(ArchiveError::InvalidValue {
                        what: "fingerprint",
                        value: s.to_string(),
                    })
                }
            }
        }
        Ok(Self(bytes))
    }
}

/// Perceptual digest of decoded pixel content, base64 text form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApproxFingerprint(String);

impl ApproxFingerprint {
    pub fn from_base64(s: &str) -> Result<Self> {
        // Validate eagerly so stored fingerprints always decode.
        decode_base64_hash(s)?;
        Ok(Self(s.to_string()))
    }

    /// Build from raw hash bits. Used when reconstructing from synthetic or
    /// externally supplied bit patterns.
    pub fn from_bits(bits: &[u8]) -> Result<Self> {
        use img_hash::ImageHash;
        let hash: ImageHash<Box<[u8]>> = ImageHash::from_bytes(bits).map_err(|e| {
            ArchiveError::UnsupportedFormat {
                path: Default::default(),
                detail: format!("invalid hash bits: {:?}", e),
            }
        })?;
        Ok(Self(hash.to_base64()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bits(&self) -> Result<Vec<u8>> {
        decode_base64_hash(&self.0)
    }
}

impl fmt::Display for ApproxFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn decode_base64_hash(s: &str) -> Result<Vec<u8>> {
    use img_hash::ImageHash;
    let hash = ImageHash::<Box<[u8]>>::from_base64(s).map_err(|e| {
        ArchiveError::UnsupportedFormat {
            path: Default::default(),
            detail: format!("invalid perceptual hash: {:?}", e),
        }
    })?;
    Ok(hash.as_bytes().to_vec())
}

/// Streaming SHA-256 over the complete file content. No normalization.
pub fn compute_exact(path: &Path) -> Result<ExactFingerprint> {
    let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| ArchiveError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(ExactFingerprint(hasher.finalize().into()))
}

/// Perceptual gradient hash over decoded pixel content.
///
/// The image is orientation-normalized from its EXIF tag, thumbnailed, and
/// hashed as a 16x16 difference hash (256 bits). A file the `image` crate
/// cannot decode yields `UnsupportedFormat`, never a degraded digest.
pub fn compute_approx(path: &Path) -> Result<ApproxFingerprint> {
    use img_hash::{HashAlg, HasherConfig};

    let img = image::open(path)
        .map_err(|e| ArchiveError::unsupported(path, e.to_string()))?;

    let img = apply_exif_orientation(img, read_exif_orientation(path));

    // thumbnail() preserves aspect ratio and is cheap for large inputs;
    // the hasher re-samples down to 17x16 internally anyway.
    let thumbnail = img.thumbnail(64, 64);

    let hasher = HasherConfig::new()
        .hash_size(16, 16)
        .hash_alg(HashAlg::Gradient)
        .to_hasher();

    let rgba = thumbnail.to_rgba8();
    let (width, height) = rgba.dimensions();

    let hash_img = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
        .ok_or_else(|| ArchiveError::unsupported(path, "failed to stage pixels for hashing"))?;

    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(hash_img));
    Ok(ApproxFingerprint(hash.to_base64()))
}

/// Hamming distance between two perceptual fingerprints. Symmetric.
pub fn hamming(a: &ApproxFingerprint, b: &ApproxFingerprint) -> Result<u32> {
    Ok(hamming_bits(&a.bits()?, &b.bits()?))
}

/// Hamming distance over raw hash bits. Differing lengths compare as
/// maximally distant rather than erroring, so index lookups stay total.
pub fn hamming_bits(a: &[u8], b: &[u8]) -> u32 {
    if a.len() != b.len() {
        return u32::MAX;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Read the EXIF orientation (1-8) and map to rotation degrees.
fn read_exif_orientation(path: &Path) -> i32 {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return 0,
    };
    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(e) => e,
        Err(_) => return 0,
    };

    if let Some(field) = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) {
        if let exif::Value::Short(ref v) = field.value {
            if let Some(&orientation) = v.first() {
                return match orientation {
                    6 => 90,
                    3 => 180,
                    8 => 270,
                    _ => 0,
                };
            }
        }
    }
    0
}

fn apply_exif_orientation(img: image::DynamicImage, degrees: i32) -> image::DynamicImage {
    match degrees {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn exact_is_deterministic() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", b"the same bytes");
        let h1 = compute_exact(&path).unwrap();
        let h2 = compute_exact(&path).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.to_hex().len(), 64);
    }

    #[test]
    fn exact_differs_on_single_byte_mutation() {
        let dir = tempdir().unwrap();
        let a = write_file(dir.path(), "a.bin", b"payload payload payload");
        let b = write_file(dir.path(), "b.bin", b"payload payload payloae");
        assert_ne!(compute_exact(&a).unwrap(), compute_exact(&b).unwrap());
    }

    #[test]
    fn exact_missing_file_is_io_failure() {
        let err = compute_exact(Path::new("/nonexistent/photo.jpg")).unwrap_err();
        assert!(matches!(err, ArchiveError::IoFailure { .. }));
    }

    #[test]
    fn fingerprint_hex_round_trip() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", b"round trip");
        let fp = compute_exact(&path).unwrap();
        let parsed: ExactFingerprint = fp.to_hex().parse().unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn fingerprint_parse_rejects_bad_literals() {
        let short = "abc123".parse::<ExactFingerprint>().unwrap_err();
        assert!(matches!(short, ArchiveError::InvalidValue { what: "fingerprint", .. }));
        let non_hex = "zz".repeat(32).parse::<ExactFingerprint>().unwrap_err();
        assert!(matches!(non_hex, ArchiveError::InvalidValue { what: "fingerprint", .. }));
    }

    #[test]
    fn approx_rejects_non_image() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "notes.txt", b"not an image at all");
        let err = compute_approx(&path).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedFormat { .. }));
    }

    #[test]
    fn approx_identical_file_distance_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grad.png");
        gradient_image().save(&path).unwrap();
        let a = compute_approx(&path).unwrap();
        let b = compute_approx(&path).unwrap();
        assert_eq!(hamming(&a, &b).unwrap(), 0);
    }

    #[test]
    fn approx_survives_reencoding() {
        let dir = tempdir().unwrap();
        let png = dir.path().join("img.png");
        let jpg = dir.path().join("img.jpg");
        let img = gradient_image();
        img.save(&png).unwrap();
        img.save(&jpg).unwrap();

        let a = compute_approx(&png).unwrap();
        let b = compute_approx(&jpg).unwrap();
        assert!(hamming(&a, &b).unwrap() <= 10, "re-encode crossed threshold");
    }

    #[test]
    fn approx_separates_distinct_images() {
        let dir = tempdir().unwrap();
        let a_path = dir.path().join("a.png");
        let b_path = dir.path().join("b.png");
        gradient_image().save(&a_path).unwrap();
        checker_image().save(&b_path).unwrap();

        let a = compute_approx(&a_path).unwrap();
        let b = compute_approx(&b_path).unwrap();
        assert!(hamming(&a, &b).unwrap() > 10, "distinct images within threshold");
    }

    #[test]
    fn hamming_bits_counts_flipped_bits() {
        assert_eq!(hamming_bits(&[0b1111_0000], &[0b0000_0000]), 4);
        assert_eq!(hamming_bits(&[0xff, 0x00], &[0xff, 0x00]), 0);
        assert_eq!(hamming_bits(&[0xff], &[0xff, 0x00]), u32::MAX);
    }

    fn gradient_image() -> image::DynamicImage {
        let img = image::ImageBuffer::from_fn(128, 128, |x, y| {
            image::Rgb([(x * 2) as u8, (y * 2) as u8, ((x + y) / 2) as u8])
        });
        image::DynamicImage::ImageRgb8(img)
    }

    fn checker_image() -> image::DynamicImage {
        let img = image::ImageBuffer::from_fn(128, 128, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                image::Rgb([255u8, 255, 255])
            } else {
                image::Rgb([0u8, 0, 0])
            }
        });
        image::DynamicImage::ImageRgb8(img)
    }
}
