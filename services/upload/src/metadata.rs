//! Image metadata extraction.
//!
//! Format and dimensions come from the image header (no pixel decode). Camera
//! model and GPS position come from EXIF. Nothing here fails: unreadable
//! input yields a partial or empty [`ImageMetadata`].

use crate::models::ImageMetadata;
use exif::{Exif, In, Reader, Tag};
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use tracing::debug;

/// Extract whatever metadata the bytes carry
pub fn extract(data: &[u8]) -> ImageMetadata {
    let mut metadata = ImageMetadata::default();

    match ImageReader::new(Cursor::new(data)).with_guessed_format() {
        Ok(reader) => {
            metadata.format = reader.format().map(format_tag);
            match reader.into_dimensions() {
                Ok((width, height)) => {
                    metadata.width = width;
                    metadata.height = height;
                }
                Err(e) => debug!(error = %e, "Could not read image dimensions"),
            }
        }
        Err(e) => debug!(error = %e, "Could not detect image format"),
    }

    match Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif) => apply_exif(&exif, &mut metadata),
        Err(e) => debug!(error = %e, "No readable EXIF data"),
    }

    metadata
}

/// Upper-case canonical name, e.g. `JPEG`, `PNG`, `WEBP`
pub fn format_tag(format: ImageFormat) -> String {
    format!("{format:?}").to_uppercase()
}

fn apply_exif(exif: &Exif, metadata: &mut ImageMetadata) {
    metadata.camera_model = exif
        .get_field(Tag::Model, In::PRIMARY)
        .and_then(field_as_string);

    let latitude = gps_coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S");
    let longitude = gps_coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W");

    if let Some((lat, lon)) = gps_pair(latitude, longitude) {
        metadata.latitude = Some(lat);
        metadata.longitude = Some(lon);
    }
}

/// Both coordinates, or nothing. A zero on either axis is indistinguishable
/// from "not recorded" and drops the pair.
fn gps_pair(latitude: Option<f64>, longitude: Option<f64>) -> Option<(f64, f64)> {
    match (latitude?, longitude?) {
        (lat, lon) if lat != 0.0 && lon != 0.0 => Some((lat, lon)),
        _ => None,
    }
}

/// Signed decimal degrees from a DMS field and its hemisphere reference
fn gps_coordinate(exif: &Exif, value_tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let dms = match &exif.get_field(value_tag, In::PRIMARY)?.value {
        exif::Value::Rational(v) => dms_to_decimal(v)?,
        _ => return None,
    };
    let hemisphere = exif
        .get_field(ref_tag, In::PRIMARY)
        .and_then(field_as_string);

    Some(apply_hemisphere(dms, hemisphere.as_deref(), negative_ref))
}

fn apply_hemisphere(degrees: f64, hemisphere: Option<&str>, negative_ref: &str) -> f64 {
    match hemisphere {
        Some(h) if h.eq_ignore_ascii_case(negative_ref) => -degrees,
        _ => degrees,
    }
}

/// Non-empty trimmed ASCII value
fn field_as_string(field: &exif::Field) -> Option<String> {
    match &field.value {
        exif::Value::Ascii(vecs) => vecs
            .first()
            .map(|v| {
                String::from_utf8_lossy(v)
                    .trim_matches(char::from(0))
                    .trim()
                    .to_string()
            })
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

/// Converts DMS (degrees/minutes/seconds) to decimal degrees
fn dms_to_decimal(dms: &[exif::Rational]) -> Option<f64> {
    if dms.len() < 3 {
        return None;
    }
    let degrees = dms[0].to_f64() + dms[1].to_f64() / 60.0 + dms[2].to_f64() / 3600.0;
    degrees.is_finite().then_some(degrees)
}
