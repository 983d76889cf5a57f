//! Content extraction for attachments.
//!
//! Turns a file path plus its declared [`AttachmentType`] into the text (or
//! base64 PNG) stored on the attachment.

mod picture;
mod odt;
mod office;

use shared::AttachmentType;
use std::path::Path;

pub use self::picture::{
    encode_dynamic_image, encode_image, resize_dimensions, IMAGE_MAX_SIZE, PROFILE_PICTURE_MAX_SIZE,
};
pub use self::odt::{markdown_table, odt_to_markdown};
pub use self::office::{docx_to_text, pptx_to_text, xlsx_to_markdown};

/// Why a file produced no content
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("could not read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open image: {0}")]
    Image(#[from] ::image::ImageError),

    #[error("unsupported or corrupt document: {0}")]
    Format(String),
}

impl From<zip::result::ZipError> for ExtractError {
    fn from(err: zip::result::ZipError) -> Self {
        ExtractError::Format(err.to_string())
    }
}

impl From<calamine::XlsxError> for ExtractError {
    fn from(err: calamine::XlsxError) -> Self {
        ExtractError::Format(err.to_string())
    }
}

impl From<quick_xml::Error> for ExtractError {
    fn from(err: quick_xml::Error) -> Self {
        ExtractError::Format(err.to_string())
    }
}

/// Extract attachment content from `path` according to `kind`.
pub fn extract_content(path: &Path, kind: AttachmentType) -> Result<String, ExtractError> {
    if !path.exists() {
        return Err(ExtractError::NotFound(path.display().to_string()));
    }

    match kind {
        AttachmentType::Image => encode_image(path, IMAGE_MAX_SIZE),
        AttachmentType::ProfilePicture => encode_image(path, PROFILE_PICTURE_MAX_SIZE),
        AttachmentType::PlainText
        | AttachmentType::Code
        | AttachmentType::Youtube
        | AttachmentType::Website => Ok(std::fs::read_to_string(path)?),
        AttachmentType::Pdf => pdf_extract::extract_text(path)
            .map_err(|e| ExtractError::Format(format!("failed to extract pdf text: {e}"))),
        AttachmentType::Docx => docx_to_text(path),
        AttachmentType::Pptx => pptx_to_text(path),
        AttachmentType::Xlsx => xlsx_to_markdown(path),
        AttachmentType::Odt => odt_to_markdown(path),
    }
}

/// Read one XML part out of a zip container (docx, pptx, xlsx, odt).
pub(crate) fn read_zip_part(
    archive: &mut zip::ZipArchive<std::fs::File>,
    name: &str,
) -> Result<String, ExtractError> {
    use std::io::Read;

    let mut part = archive
        .by_name(name)
        .map_err(|_| ExtractError::Format(format!("missing {name}")))?;
    let mut xml = String::new();
    part.read_to_string(&mut xml)?;
    Ok(xml)
}
