//! Attachment records bound to messages.
//!
//! An attachment is created when the user attaches, pastes or drops something,
//! waits in the pending store until send, and is then persisted with its message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Source-code and markup extensions accepted as `code` attachments.
pub const CODE_EXTENSIONS: &[&str] = &[
    "c", "h", "css", "html", "js", "ts", "py", "java", "json", "xml", "asm", "nasm", "cs", "csx",
    "cpp", "cxx", "cp", "hxx", "inc", "csv", "lsp", "lisp", "el", "emacs", "l", "cu",
    "dockerfile", "glsl", "g", "lua", "php", "rb", "ru", "rs", "sql", "sh", "p8",
];

/// Image extensions accepted from drops and the file picker.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpeg", "jpg", "webp", "gif"];

/// Kind of content an attachment carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentType {
    Image,
    PlainText,
    Code,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Odt,
    Youtube,
    Website,
    ProfilePicture,
}

impl AttachmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentType::Image => "image",
            AttachmentType::PlainText => "plain_text",
            AttachmentType::Code => "code",
            AttachmentType::Pdf => "pdf",
            AttachmentType::Docx => "docx",
            AttachmentType::Pptx => "pptx",
            AttachmentType::Xlsx => "xlsx",
            AttachmentType::Odt => "odt",
            AttachmentType::Youtube => "youtube",
            AttachmentType::Website => "website",
            AttachmentType::ProfilePicture => "profile_picture",
        }
    }

    /// Classify a file by extension. Unknown extensions yield `None`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_lowercase();
        // `Dockerfile` is the only extensionless name listed as code
        let extension = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.to_lowercase(),
            None if file_name == "dockerfile" => file_name,
            None => return None,
        };

        match extension.as_str() {
            ext if IMAGE_EXTENSIONS.contains(&ext) => Some(AttachmentType::Image),
            "txt" | "md" => Some(AttachmentType::PlainText),
            ext if CODE_EXTENSIONS.contains(&ext) => Some(AttachmentType::Code),
            "pdf" => Some(AttachmentType::Pdf),
            "docx" => Some(AttachmentType::Docx),
            "pptx" => Some(AttachmentType::Pptx),
            "xlsx" => Some(AttachmentType::Xlsx),
            "odt" => Some(AttachmentType::Odt),
            _ => None,
        }
    }

    /// Whether the content is base64 image data rather than text
    pub fn is_image(&self) -> bool {
        matches!(self, AttachmentType::Image | AttachmentType::ProfilePicture)
    }
}

impl fmt::Display for AttachmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "image" => AttachmentType::Image,
            "plain_text" => AttachmentType::PlainText,
            "code" => AttachmentType::Code,
            "pdf" => AttachmentType::Pdf,
            "docx" => AttachmentType::Docx,
            "pptx" => AttachmentType::Pptx,
            "xlsx" => AttachmentType::Xlsx,
            "odt" => AttachmentType::Odt,
            "youtube" => AttachmentType::Youtube,
            "website" => AttachmentType::Website,
            "profile_picture" => AttachmentType::ProfilePicture,
            other => anyhow::bail!("unknown attachment type: {other}"),
        })
    }
}

/// A file, page or transcript attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Display name, unique within the pending set
    pub name: String,
    pub kind: AttachmentType,
    /// Extracted text, or base64 PNG for images
    pub content: String,
    /// Where the content came from (may be a cache file for fetched content)
    pub path: Option<PathBuf>,
}

impl Attachment {
    pub fn new(
        name: impl Into<String>,
        kind: AttachmentType,
        content: impl Into<String>,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            content: content.into(),
            path,
        }
    }
}
