use lopdf::Document;

use crate::error::AppError;

/// Plain text from an uploaded PDF brief, page texts joined by blank lines.
/// The result feeds the spec extractor identically to a chat message.
pub fn extract_text(pdf_bytes: &[u8]) -> Result<String, AppError> {
    let doc = Document::load_mem(pdf_bytes)
        .map_err(|e| AppError::Validation(format!("Could not parse PDF: {e}")))?;
    let mut chunks: Vec<String> = Vec::new();
    for page_number in doc.get_pages().keys() {
        // Pages with unextractable text are skipped, not fatal.
        if let Ok(text) = doc.extract_text(&[*page_number]) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
        }
    }
    Ok(chunks.join("\n\n").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_bytes_are_a_validation_error() {
        let err = extract_text(b"definitely not a pdf").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().starts_with("Could not parse PDF"));
    }
}
