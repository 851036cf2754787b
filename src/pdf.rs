use tracing::{debug, warn};

/// Outcome of a best-effort PDF text extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdfText {
    /// The document had a usable text layer.
    Text(String),
    /// Extraction gave up; the reason is suitable for a diagnostic.
    Unavailable(String),
}

/// Extracts the text layer of a PDF held in memory.
///
/// Never fails hard: oversized documents, parser errors and image-only scans all
/// come back as `PdfText::Unavailable`. Parsing runs on the blocking pool since
/// pdf-extract is CPU bound and may panic on malformed input.
pub async fn extract_text(bytes: Vec<u8>, max_bytes: usize) -> PdfText {
    if bytes.len() > max_bytes {
        warn!(bytes = bytes.len(), max_bytes, "PDF exceeds size ceiling");
        return PdfText::Unavailable(format!(
            "PDF too large ({} bytes, limit {})",
            bytes.len(),
            max_bytes
        ));
    }

    let result = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes)).await;

    match result {
        Ok(Ok(text)) => {
            let text = normalize(&text);
            if text.is_empty() {
                debug!("PDF has no text layer");
                PdfText::Unavailable("PDF has no extractable text layer".to_string())
            } else {
                PdfText::Text(text)
            }
        }
        Ok(Err(e)) => {
            warn!(error = %e, "PDF parsing failed");
            PdfText::Unavailable(format!("PDF parsing failed: {}", e))
        }
        Err(e) => {
            warn!(error = %e, "PDF parser aborted");
            PdfText::Unavailable("PDF parser aborted".to_string())
        }
    }
}

/// Joins wrapped lines back into paragraphs, keeping blank-line paragraph breaks.
fn normalize(text: &str) -> String {
    text.split("\n\n")
        .map(|para| para.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|para| !para.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
