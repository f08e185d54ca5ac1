//! Text extraction for uploaded binaries.
//!
//! Decodes a blob plus its declared content type into page-tagged text.
//! Extraction is pure: no network, no filesystem. Output text is NFC
//! normalized with whitespace runs collapsed and control characters
//! stripped (newline survives, it carries sentence-boundary information
//! for the chunker).

use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};
use crate::models::PageText;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PDF: &str = "application/pdf";

/// Form feed separates pages in plain-text uploads.
const PAGE_BREAK: char = '\x0c';

/// Extract page-tagged text from an uploaded blob.
///
/// # Errors
///
/// - [`Error::UnsupportedFormat`] for content types outside the supported set.
/// - [`Error::CorruptInput`] when decoding fails or yields no text at all.
pub fn extract(bytes: &[u8], declared_type: &str) -> Result<Vec<PageText>> {
    let pages = match declared_type {
        MIME_TEXT | MIME_MARKDOWN => extract_plain(bytes)?,
        MIME_PDF => extract_pdf(bytes)?,
        other => return Err(Error::UnsupportedFormat(other.to_string())),
    };

    let pages: Vec<PageText> = pages
        .into_iter()
        .map(|p| PageText {
            page: p.page,
            text: normalize_text(&p.text),
        })
        .filter(|p| !p.text.is_empty())
        .collect();

    if pages.is_empty() {
        return Err(Error::CorruptInput("no text extracted".to_string()));
    }
    Ok(pages)
}

fn extract_plain(bytes: &[u8]) -> Result<Vec<PageText>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::CorruptInput(format!("invalid utf-8: {}", e)))?;

    Ok(text
        .split(PAGE_BREAK)
        .enumerate()
        .map(|(i, page_text)| PageText {
            page: i as u32 + 1,
            text: page_text.to_string(),
        })
        .collect())
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<PageText>> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| Error::CorruptInput(format!("pdf extraction failed: {}", e)))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| PageText {
            page: i as u32 + 1,
            text,
        })
        .collect())
}

/// NFC-normalize, strip control characters (except newline), and collapse
/// whitespace runs. A run containing a newline collapses to one newline,
/// any other run to one space, so paragraph structure survives.
pub fn normalize_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();

    let mut out = String::with_capacity(nfc.len());
    let mut run_has_newline = false;
    let mut in_run = false;

    for ch in nfc.chars() {
        if ch.is_whitespace() {
            in_run = true;
            if ch == '\n' || ch == '\r' {
                run_has_newline = true;
            }
            continue;
        }
        if ch.is_control() {
            continue;
        }
        if in_run {
            if !out.is_empty() {
                out.push(if run_has_newline { '\n' } else { ' ' });
            }
            in_run = false;
            run_has_newline = false;
        }
        out.push(ch);
    }

    out
}
