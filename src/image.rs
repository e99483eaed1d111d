use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("image descriptor must have exactly three '::' fields, got {found}: {descriptor}")]
    FieldCount { descriptor: String, found: usize },
    #[error("image type must be 'disk' or 'memory', got '{value}' in: {descriptor}")]
    UnknownType { descriptor: String, value: String },
    #[error("image descriptor has an empty {field} field: {descriptor}")]
    EmptyField {
        descriptor: String,
        field: &'static str,
    },
}

/// Authoritative image kind, taken from field 2 of the descriptor and from
/// nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    Disk,
    Memory,
}

impl ImageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Memory => "memory",
        }
    }
}

/// One evidence image submitted to a job. Immutable after classification.
///
/// The locator is a mount point for disk images and a source directory for
/// memory images; it carries no type information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub filename: String,
    pub locator: String,
    pub image_type: ImageType,
}

/// Parse a `filename::locator::type` descriptor into an [`Image`].
///
/// This is the single code path that inspects the type field. Any other
/// field count, or a type other than `disk`/`memory` (case-insensitive),
/// is rejected before a job can be created.
pub fn classify(descriptor: &str) -> Result<Image, ValidationError> {
    let fields: Vec<&str> = descriptor.split("::").collect();
    if fields.len() != 3 {
        return Err(ValidationError::FieldCount {
            descriptor: descriptor.to_string(),
            found: fields.len(),
        });
    }

    let filename = fields[0].trim();
    let locator = fields[1].trim();
    let type_field = fields[2].trim();

    if filename.is_empty() {
        return Err(ValidationError::EmptyField {
            descriptor: descriptor.to_string(),
            field: "filename",
        });
    }
    if locator.is_empty() {
        return Err(ValidationError::EmptyField {
            descriptor: descriptor.to_string(),
            field: "locator",
        });
    }

    let image_type = if type_field.eq_ignore_ascii_case("disk") {
        ImageType::Disk
    } else if type_field.eq_ignore_ascii_case("memory") {
        ImageType::Memory
    } else {
        return Err(ValidationError::UnknownType {
            descriptor: descriptor.to_string(),
            value: type_field.to_string(),
        });
    };

    Ok(Image {
        filename: filename.to_string(),
        locator: locator.to_string(),
        image_type,
    })
}

/// Parked metadata for a memory image awaiting the DeferredMemory phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProfile {
    pub filename: String,
    pub locator: String,
    /// Platform guess made during Identification (e.g. "windows", "linux").
    pub platform: Option<String>,
    /// Analysis engine selected for this image.
    pub engine: Option<String>,
    /// Auxiliary acquisitions keyed by kind (shadow-copy memory, memory
    /// timeline) mapping to their paths.
    pub aux_paths: BTreeMap<String, String>,
}

impl MemoryProfile {
    pub fn new(image: &Image) -> Self {
        Self {
            filename: image.filename.clone(),
            locator: image.locator.clone(),
            platform: None,
            engine: None,
            aux_paths: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_disk_descriptor() {
        let image = classify("win7-64-disk.E01::/mnt/elrond_mount00::disk").expect("classify");
        assert_eq!(image.filename, "win7-64-disk.E01");
        assert_eq!(image.locator, "/mnt/elrond_mount00");
        assert_eq!(image.image_type, ImageType::Disk);
    }

    #[test]
    fn classifies_memory_descriptor_case_insensitive() {
        let image = classify("ram.lime::/data/memdumps::Memory").expect("classify");
        assert_eq!(image.image_type, ImageType::Memory);
    }

    #[test]
    fn locator_content_never_affects_type() {
        let image = classify("disk01.dd::/mnt/memory_dumps/staging::disk").expect("classify");
        assert_eq!(image.image_type, ImageType::Disk);

        let image = classify("mem.raw::/mnt/disk_images::memory").expect("classify");
        assert_eq!(image.image_type, ImageType::Memory);
    }

    #[test]
    fn rejects_two_field_descriptor() {
        let err = classify("image.dd::/mnt/point").expect_err("should fail");
        assert!(matches!(err, ValidationError::FieldCount { found: 2, .. }));
    }

    #[test]
    fn rejects_four_field_descriptor() {
        let err = classify("a::b::disk::extra").expect_err("should fail");
        assert!(matches!(err, ValidationError::FieldCount { found: 4, .. }));
    }

    #[test]
    fn rejects_unknown_type_without_defaulting() {
        let err = classify("image.dd::/mnt/point::tape").expect_err("should fail");
        assert!(matches!(err, ValidationError::UnknownType { .. }));
    }

    #[test]
    fn rejects_empty_locator() {
        let err = classify("image.dd::::disk").expect_err("should fail");
        assert!(matches!(
            err,
            ValidationError::EmptyField { field: "locator", .. }
        ));
    }
}
