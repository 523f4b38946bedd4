//! Request validation for job creation and review commands.
//!
//! Everything here runs before a job exists, so a rejected request leaves
//! no record behind.

use garde::Validate;
use image::ImageFormat;

use crate::error::{JobError, JobResult};
use crate::models::job::DocumentFormat;

/// Most reference images accepted with one upload.
pub const MAX_REFERENCE_IMAGES: usize = 5;

pub const MAX_INSTRUCTIONS_CHARS: usize = 4000;

/// A file part received over multipart.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Free-form fields sent with an essay upload.
#[derive(Debug, Clone, Validate)]
pub struct UploadSettings {
    #[garde(range(min = 0.0, max = 1.0))]
    pub humanization_intensity: f64,
    #[garde(length(min = 1, max = 200))]
    pub student_name: Option<String>,
    #[garde(length(min = 1, max = 200))]
    pub course_name: Option<String>,
    #[garde(length(max = 4000))]
    pub additional_prompt: Option<String>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            humanization_intensity: 0.5,
            student_name: None,
            course_name: None,
            additional_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub file: Option<UploadedFile>,
    pub settings: UploadSettings,
    pub reference_images: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportRequest {
    pub file: Option<UploadedFile>,
    pub text_content: Option<String>,
    pub refinement_instructions: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_upload_bytes: usize,
    /// Minimum trimmed length of pasted import text.
    pub min_import_chars: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            min_import_chars: 50,
        }
    }
}

/// Check an uploaded source document and return its format.
pub fn validate_document(file: &UploadedFile, limits: &UploadLimits) -> JobResult<DocumentFormat> {
    let format = DocumentFormat::from_filename(&file.filename).ok_or_else(|| {
        JobError::UnsupportedMediaType(
            "Invalid file type. Only PDF and DOCX files are allowed.".to_string(),
        )
    })?;
    if file.bytes.is_empty() {
        return Err(JobError::Validation("Uploaded file is empty".to_string()));
    }
    check_size(file.bytes.len(), limits)?;
    Ok(format)
}

/// Sniff a reference image and return its MIME type.
pub fn validate_image(file: &UploadedFile, limits: &UploadLimits) -> JobResult<&'static str> {
    check_size(file.bytes.len(), limits)?;
    let format = image::guess_format(&file.bytes).map_err(|_| {
        JobError::UnsupportedMediaType(format!("{} is not a recognised image", file.filename))
    })?;
    match format {
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP | ImageFormat::Gif => {
            Ok(format.to_mime_type())
        }
        other => Err(JobError::UnsupportedMediaType(format!(
            "{} images are not supported",
            other.to_mime_type()
        ))),
    }
}

/// Validate the non-file parts of an upload. Returns the MIME type of each
/// reference image in order.
pub fn validate_upload(request: &UploadRequest, limits: &UploadLimits) -> JobResult<Vec<&'static str>> {
    request
        .settings
        .validate()
        .map_err(|report| JobError::Validation(report.to_string()))?;

    if request.reference_images.len() > MAX_REFERENCE_IMAGES {
        return Err(JobError::Validation(format!(
            "At most {MAX_REFERENCE_IMAGES} reference images are allowed"
        )));
    }
    request
        .reference_images
        .iter()
        .map(|image| validate_image(image, limits))
        .collect()
}

/// Pasted import text must carry enough content to structure.
pub fn validate_import_text(text: &str, limits: &UploadLimits) -> JobResult<()> {
    let length = text.trim().chars().count();
    if length < limits.min_import_chars {
        return Err(JobError::Validation(format!(
            "Text content is too short ({length} characters, minimum {})",
            limits.min_import_chars
        )));
    }
    check_size(text.len(), limits)
}

/// Refine instructions must be non-blank and bounded. Returns them trimmed.
pub fn validate_instructions(instructions: &str) -> JobResult<&str> {
    let trimmed = instructions.trim();
    if trimmed.is_empty() {
        return Err(JobError::Validation("Instructions must not be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_INSTRUCTIONS_CHARS {
        return Err(JobError::Validation(format!(
            "Instructions exceed {MAX_INSTRUCTIONS_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

fn check_size(len: usize, limits: &UploadLimits) -> JobResult<()> {
    if len > limits.max_upload_bytes {
        return Err(JobError::PayloadTooLarge {
            limit_mb: (limits.max_upload_bytes / (1024 * 1024)) as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn file(name: &str, bytes: &[u8]) -> UploadedFile {
        UploadedFile {
            filename: name.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_document_extension_is_case_insensitive() {
        let limits = UploadLimits::default();
        assert_eq!(
            validate_document(&file("Prompt.PDF", b"%PDF-1.7"), &limits).unwrap(),
            DocumentFormat::Pdf
        );
        assert_eq!(
            validate_document(&file("brief.docx", b"PK"), &limits).unwrap(),
            DocumentFormat::Docx
        );
    }

    #[test]
    fn test_document_rejects_other_types() {
        let err = validate_document(&file("notes.txt", b"hello"), &UploadLimits::default())
            .unwrap_err();
        assert!(matches!(err, JobError::UnsupportedMediaType(_)));
    }

    #[test]
    fn test_document_size_limit() {
        let limits = UploadLimits {
            max_upload_bytes: 1024 * 1024,
            ..UploadLimits::default()
        };
        let big = vec![0u8; 1024 * 1024 + 1];
        let err = validate_document(&file("a.pdf", &big), &limits).unwrap_err();
        assert!(matches!(err, JobError::PayloadTooLarge { limit_mb: 1 }));
    }

    #[test]
    fn test_empty_document_rejected() {
        let err = validate_document(&file("a.pdf", b""), &UploadLimits::default()).unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn test_image_sniffing() {
        let limits = UploadLimits::default();
        assert_eq!(validate_image(&file("chart.bin", PNG_HEADER), &limits).unwrap(), "image/png");
        assert!(matches!(
            validate_image(&file("chart.png", b"not an image"), &limits),
            Err(JobError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn test_upload_settings_bounds() {
        let limits = UploadLimits::default();
        let mut request = UploadRequest::default();
        assert!(validate_upload(&request, &limits).is_ok());

        request.settings.humanization_intensity = 1.5;
        assert!(matches!(
            validate_upload(&request, &limits),
            Err(JobError::Validation(_))
        ));

        request.settings.humanization_intensity = 0.2;
        request.settings.student_name = Some(String::new());
        assert!(validate_upload(&request, &limits).is_err());
    }

    #[test]
    fn test_reference_image_count() {
        let limits = UploadLimits::default();
        let request = UploadRequest {
            reference_images: vec![file("a.png", PNG_HEADER); 6],
            ..UploadRequest::default()
        };
        assert!(matches!(
            validate_upload(&request, &limits),
            Err(JobError::Validation(_))
        ));
    }

    #[test]
    fn test_import_text_minimum_counts_trimmed_chars() {
        let limits = UploadLimits::default();
        let padded = format!("   {}   ", "a".repeat(49));
        assert!(validate_import_text(&padded, &limits).is_err());
        assert!(validate_import_text(&"a".repeat(50), &limits).is_ok());
    }

    #[test]
    fn test_instructions_trimmed() {
        assert_eq!(validate_instructions("  shorten it \n").unwrap(), "shorten it");
        assert!(validate_instructions(" \t ").is_err());
        assert!(validate_instructions(&"x".repeat(MAX_INSTRUCTIONS_CHARS + 1)).is_err());
    }
}
