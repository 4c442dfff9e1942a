//! Text extraction for uploaded documents.
//!
//! Extraction is pipeline-layer: the upload boundary supplies raw bytes
//! plus a filename; this module returns an ordered sequence of page texts.
//! PDF extraction goes through `pdf-extract`; plain text and markdown are
//! UTF-8 passthrough.

use std::path::Path;

use crate::error::{ChatError, IngestStage, Result};

fn extraction_failed(cause: impl Into<String>) -> ChatError {
    ChatError::Ingestion {
        stage: IngestStage::Extract,
        cause: cause.into(),
    }
}

/// Extract page texts from raw document bytes.
///
/// The document kind is inferred from the filename extension. Fails when
/// the source cannot be parsed or yields zero non-blank pages.
pub fn extract_pages(bytes: &[u8], filename: &str) -> Result<Vec<String>> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let pages = match ext.as_str() {
        "pdf" => extract_pdf(bytes)?,
        "txt" | "md" | "markdown" => extract_plain(bytes)?,
        other => {
            return Err(extraction_failed(format!(
                "unsupported document type: .{}",
                other
            )))
        }
    };

    let pages: Vec<String> = pages
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect();

    if pages.is_empty() {
        return Err(extraction_failed("document is empty or yielded no text"));
    }

    Ok(pages)
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<String>> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| extraction_failed(format!("PDF parse error: {}", e)))?;

    // pdf-extract separates pages with form feeds when the document has
    // more than one; fall back to a single page otherwise.
    if text.contains('\u{c}') {
        Ok(text.split('\u{c}').map(|p| p.to_string()).collect())
    } else {
        Ok(vec![text])
    }
}

fn extract_plain(bytes: &[u8]) -> Result<Vec<String>> {
    let text = String::from_utf8(bytes.to_vec())
        .map_err(|e| extraction_failed(format!("invalid UTF-8: {}", e)))?;
    Ok(vec![text])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_extension_fails() {
        let err = extract_pages(b"data", "archive.zip").unwrap_err();
        assert!(matches!(
            err,
            ChatError::Ingestion {
                stage: IngestStage::Extract,
                ..
            }
        ));
    }

    #[test]
    fn invalid_pdf_fails() {
        let err = extract_pages(b"not a pdf", "doc.pdf").unwrap_err();
        assert!(matches!(
            err,
            ChatError::Ingestion {
                stage: IngestStage::Extract,
                ..
            }
        ));
    }

    #[test]
    fn plain_text_passthrough() {
        let pages = extract_pages("cats are mammals".as_bytes(), "notes.txt").unwrap();
        assert_eq!(pages, vec!["cats are mammals"]);
    }

    #[test]
    fn markdown_passthrough() {
        let pages = extract_pages("# Title\n\nBody.".as_bytes(), "README.md").unwrap();
        assert_eq!(pages.len(), 1);
    }

    #[test]
    fn blank_text_fails() {
        let err = extract_pages(b"   \n  ", "empty.txt").unwrap_err();
        assert!(matches!(
            err,
            ChatError::Ingestion {
                stage: IngestStage::Extract,
                ..
            }
        ));
    }

    #[test]
    fn invalid_utf8_fails() {
        let err = extract_pages(&[0xff, 0xfe, 0xfa], "junk.txt").unwrap_err();
        assert!(matches!(
            err,
            ChatError::Ingestion {
                stage: IngestStage::Extract,
                ..
            }
        ));
    }
}
