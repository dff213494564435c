//! Document decoding: PDF, plain text, and Markdown to a [`Document`].
//!
//! The file type comes from the extension. PDF text is extracted with
//! `pdf-extract`; the page count comes from the PDF page tree (`lopdf`).
//! Text files count form-feed separated pages, minimum one.
//!
//! Document ids are derived from the file name, so importing the same
//! file again replaces the earlier index entry instead of duplicating it.

use std::path::Path;

use localllm_core::models::Document;
use uuid::Uuid;

use crate::error::ParseError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Supported input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Text,
    Markdown,
}

impl FileKind {
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name)
            .extension()?
            .to_str()?
            .to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(FileKind::Pdf),
            "txt" | "text" | "log" => Some(FileKind::Text),
            "md" | "markdown" => Some(FileKind::Markdown),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FileKind::Pdf => MIME_PDF,
            FileKind::Text => MIME_TEXT,
            FileKind::Markdown => MIME_MARKDOWN,
        }
    }
}

/// Stable document id for a file name.
pub fn document_id_for(file_name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, file_name.as_bytes()).to_string()
}

/// Read and decode a file. PDF extraction runs on the blocking pool.
pub async fn parse(path: &Path, file_name: &str) -> Result<Document, ParseError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ParseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let file_name = file_name.to_string();
    tokio::task::spawn_blocking(move || parse_bytes(&bytes, &file_name))
        .await
        .map_err(|e| ParseError::Pdf(format!("decoder task failed: {}", e)))?
}

/// Decode in-memory file content.
pub fn parse_bytes(bytes: &[u8], file_name: &str) -> Result<Document, ParseError> {
    let kind = FileKind::from_file_name(file_name)
        .ok_or_else(|| ParseError::Unsupported(file_name.to_string()))?;

    let (content, page_count) = match kind {
        FileKind::Pdf => extract_pdf(bytes)?,
        FileKind::Text | FileKind::Markdown => {
            let text = decode_utf8(bytes)?;
            let pages = count_form_feed_pages(&text);
            (text, pages)
        }
    };

    tracing::debug!(
        file_name,
        kind = kind.mime_type(),
        page_count,
        chars = content.len(),
        "decoded document"
    );

    Ok(Document::from_text(
        document_id_for(file_name),
        file_name,
        content,
        page_count,
    ))
}

fn extract_pdf(bytes: &[u8]) -> Result<(String, usize), ParseError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ParseError::Pdf(e.to_string()))?;
    let pages = match lopdf::Document::load_mem(bytes) {
        Ok(doc) => doc.get_pages().len().max(1),
        Err(e) => {
            tracing::warn!(error = %e, "could not read PDF page tree, counting form feeds");
            count_form_feed_pages(&text)
        }
    };
    Ok((text, pages))
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ParseError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| ParseError::Encoding(e.to_string()))
}

fn count_form_feed_pages(text: &str) -> usize {
    text.split('\x0c')
        .filter(|page| !page.trim().is_empty())
        .count()
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_from_extension() {
        assert_eq!(FileKind::from_file_name("a.PDF"), Some(FileKind::Pdf));
        assert_eq!(FileKind::from_file_name("notes.md"), Some(FileKind::Markdown));
        assert_eq!(FileKind::from_file_name("readme.txt"), Some(FileKind::Text));
        assert_eq!(FileKind::from_file_name("image.png"), None);
        assert_eq!(FileKind::from_file_name("no_extension"), None);
    }

    #[test]
    fn test_parse_text_counts() {
        let doc = parse_bytes(b"hello world\x0csecond page", "a.txt").unwrap();
        assert_eq!(doc.file_name, "a.txt");
        assert_eq!(doc.page_count, 2);
        assert_eq!(doc.word_count, 3);
        assert_eq!(doc.char_count, doc.content.chars().count());
        assert_eq!(doc.id, document_id_for("a.txt"));
    }

    #[test]
    fn test_parse_strips_bom() {
        let doc = parse_bytes(b"\xEF\xBB\xBF# Title", "a.md").unwrap();
        assert_eq!(doc.content, "# Title");
        assert_eq!(doc.page_count, 1);
    }

    #[test]
    fn test_unsupported_type() {
        assert!(matches!(
            parse_bytes(b"\x89PNG", "image.png"),
            Err(ParseError::Unsupported(_))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(matches!(
            parse_bytes(&[0xff, 0xfe, 0x00], "bad.txt"),
            Err(ParseError::Encoding(_))
        ));
    }

    #[test]
    fn test_invalid_pdf() {
        assert!(matches!(
            parse_bytes(b"not a pdf", "broken.pdf"),
            Err(ParseError::Pdf(_))
        ));
    }

    #[tokio::test]
    async fn test_parse_missing_file() {
        let err = parse(Path::new("/nonexistent/file.txt"), "file.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
    }
}
