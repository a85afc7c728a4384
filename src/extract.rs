//! Text extraction from stored uploads.
//!
//! The pipeline only sees the [`Extractor`] trait; [`FileExtractor`] is the
//! default implementation and picks a format by file extension:
//!
//! | Extension | Output |
//! |-----------|--------|
//! | `txt`, `md`, `markdown` | one segment with the whole file (lossy UTF-8) |
//! | `pdf` | one segment per page with text, numbered from 1 |
//! | `docx` | one segment; paragraphs separated by newlines |
//!
//! An empty result is a valid outcome (for example a scanned PDF with no
//! text layer). Unreadable files and unsupported extensions are errors.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use std::io::Read;
use std::path::Path;

use crate::models::Segment;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Turns a stored document into ordered text segments.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, source_id: &str, path: &Path) -> anyhow::Result<Vec<Segment>>;
}

/// Extension-based extractor for plain text, PDF, and DOCX files.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileExtractor;

#[async_trait]
impl Extractor for FileExtractor {
    async fn extract(&self, source_id: &str, path: &Path) -> anyhow::Result<Vec<Segment>> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let source_id = source_id.to_string();
        match ext.as_str() {
            "txt" | "md" | "markdown" => Ok(single_segment(
                String::from_utf8_lossy(&bytes).into_owned(),
                source_id,
            )),
            "pdf" => {
                let pages = tokio::task::spawn_blocking(move || extract_pdf_pages(&bytes))
                    .await
                    .map_err(|e| anyhow!("PDF extraction task failed: {}", e))??;
                Ok(pages
                    .into_iter()
                    .enumerate()
                    .filter(|(_, text)| !text.trim().is_empty())
                    .map(|(i, text)| Segment::new(text, source_id.clone()).with_page(i as u32 + 1))
                    .collect())
            }
            "docx" => {
                let text = tokio::task::spawn_blocking(move || extract_docx(&bytes))
                    .await
                    .map_err(|e| anyhow!("DOCX extraction task failed: {}", e))??;
                Ok(single_segment(text, source_id))
            }
            "" => bail!("{} has no file extension", path.display()),
            other => bail!("unsupported file type: .{}", other),
        }
    }
}

fn single_segment(text: String, source_id: String) -> Vec<Segment> {
    if text.trim().is_empty() {
        Vec::new()
    } else {
        vec![Segment::new(text, source_id)]
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> anyhow::Result<Vec<String>> {
    pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| anyhow!("PDF extraction failed: {}", e))
}

fn extract_docx(bytes: &[u8]) -> anyhow::Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .context("DOCX extraction failed: not a ZIP archive")?;
    let entry = archive
        .by_name("word/document.xml")
        .context("DOCX extraction failed: word/document.xml not found")?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .context("DOCX extraction failed")?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        bail!("word/document.xml exceeds size limit ({} bytes)", MAX_XML_ENTRY_BYTES);
    }

    extract_paragraphs(&xml)
}

/// Collect `w:t` runs, ending each `w:p` paragraph with a newline.
fn extract_paragraphs(xml: &[u8]) -> anyhow::Result<String> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => bail!("DOCX extraction failed: {}", e),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim_end().to_string())
}
