//! Document parsing
//!
//! Extracts plain text from the supported upload formats. The format is
//! chosen from the filename suffix, never from content sniffing, and the
//! suffix is validated against the configured allowlist before any body
//! bytes are read.

use crate::errors::{AppError, Result};
use scraper::Html;
use std::path::Path;
use tracing::{debug, warn};

/// Length of the separator line inserted after a CSV header row
const CSV_HEADER_RULE_LEN: usize = 50;

/// Stateless document parser
#[derive(Debug, Clone, Default)]
pub struct DocumentParser;

impl DocumentParser {
    pub fn new() -> Self {
        Self
    }

    /// Extract plain text from a document, dispatching on the suffix
    pub fn parse(&self, filename: &str, content: &[u8]) -> Result<String> {
        match file_extension(filename).as_str() {
            ".txt" | ".md" | ".markdown" => Ok(String::from_utf8_lossy(content).into_owned()),
            ".pdf" => self.parse_pdf(content),
            ".json" => self.parse_json(content),
            ".csv" => self.parse_csv(content),
            ".html" | ".htm" => self.parse_html(content),
            other => Err(AppError::UnsupportedFileType(other.to_string())),
        }
    }

    /// Check the suffix against the allowlist (lowercased, with the dot)
    pub fn validate_file_type(&self, filename: &str, allowed_types: &[String]) -> Result<()> {
        let ext = file_extension(filename);

        debug!(filename, ext = %ext, ?allowed_types, "Validating file type");

        if allowed_types.iter().any(|allowed| *allowed == ext) {
            Ok(())
        } else {
            Err(AppError::UnsupportedFileType(ext))
        }
    }

    fn parse_pdf(&self, content: &[u8]) -> Result<String> {
        let doc = lopdf::Document::load_mem(content)
            .map_err(|e| AppError::ParseFailed(format!("failed to read PDF: {e}")))?;

        let pages = doc.get_pages();
        debug!(total_pages = pages.len(), content_size = content.len(), "Parsing PDF");

        let mut text = String::new();
        for &page_num in pages.keys() {
            match doc.extract_text(&[page_num]) {
                Ok(page_text) => {
                    text.push_str(&page_text);
                    text.push_str("\n\n");
                }
                Err(e) => {
                    warn!(page = page_num, error = %e, "Failed to extract text from PDF page");
                }
            }
        }

        let result = text.trim().to_string();
        if result.is_empty() {
            return Err(AppError::ParseFailed(
                "no text content found in PDF".to_string(),
            ));
        }

        Ok(result)
    }

    fn parse_json(&self, content: &[u8]) -> Result<String> {
        let data: serde_json::Value = serde_json::from_slice(content)
            .map_err(|e| AppError::ParseFailed(format!("failed to parse JSON: {e}")))?;

        serde_json::to_string_pretty(&data)
            .map_err(|e| AppError::ParseFailed(format!("failed to format JSON: {e}")))
    }

    fn parse_csv(&self, content: &[u8]) -> Result<String> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(content);

        let records: Vec<csv::StringRecord> = reader
            .records()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| AppError::ParseFailed(format!("failed to parse CSV: {e}")))?;

        let mut result = String::new();
        for (i, record) in records.iter().enumerate() {
            result.push_str(&record.iter().collect::<Vec<_>>().join(" | "));
            result.push('\n');

            // Separator line after the header row
            if i == 0 && records.len() > 1 {
                result.push_str(&"-".repeat(CSV_HEADER_RULE_LEN));
                result.push('\n');
            }
        }

        Ok(result)
    }

    fn parse_html(&self, content: &[u8]) -> Result<String> {
        let html = String::from_utf8_lossy(content);
        let document = Html::parse_document(&html);

        // Depth-first text nodes, whitespace runs collapsed to single spaces
        let text = document
            .root_element()
            .text()
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ");

        Ok(text)
    }
}

/// Lowercased suffix of a filename including the leading dot; empty when the
/// filename has no suffix
fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lowercased_and_dotted() {
        assert_eq!(file_extension("report.PDF"), ".pdf");
        assert_eq!(file_extension("notes.md"), ".md");
        assert_eq!(file_extension("no_extension"), "");
    }

    #[test]
    fn plain_text_passes_through() {
        let parser = DocumentParser::new();
        let text = parser.parse("notes.txt", b"hello world").unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn markdown_passes_through() {
        let parser = DocumentParser::new();
        let body = "# Hi\n\npara 1\n\npara 2";
        assert_eq!(parser.parse("hello.md", body.as_bytes()).unwrap(), body);
    }

    #[test]
    fn json_is_reemitted_pretty() {
        let parser = DocumentParser::new();
        let text = parser.parse("data.json", br#"{"b":1,"a":[1,2]}"#).unwrap();
        assert!(text.contains("\"a\": ["));
        assert!(text.lines().count() > 1);
    }

    #[test]
    fn invalid_json_fails() {
        let parser = DocumentParser::new();
        let err = parser.parse("data.json", b"{not json").unwrap_err();
        assert!(matches!(err, AppError::ParseFailed(_)));
    }

    #[test]
    fn csv_joins_fields_and_rules_off_header() {
        let parser = DocumentParser::new();
        let text = parser
            .parse("table.csv", b"name,age\nalice,30\nbob,25\n")
            .unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "name | age");
        assert_eq!(lines[1], "-".repeat(50));
        assert_eq!(lines[2], "alice | 30");
        assert_eq!(lines[3], "bob | 25");
    }

    #[test]
    fn csv_single_row_has_no_rule() {
        let parser = DocumentParser::new();
        let text = parser.parse("table.csv", b"only,row\n").unwrap();
        assert_eq!(text, "only | row\n");
    }

    #[test]
    fn html_collapses_whitespace() {
        let parser = DocumentParser::new();
        let html = b"<html><body><h1>Title</h1>\n  <p>some\n\n   text</p></body></html>";
        let text = parser.parse("page.html", html).unwrap();
        assert_eq!(text, "Title some text");
    }

    #[test]
    fn unknown_suffix_is_rejected() {
        let parser = DocumentParser::new();
        let err = parser.parse("binary.exe", b"MZ").unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFileType(_)));
    }

    #[test]
    fn allowlist_validation() {
        let parser = DocumentParser::new();
        let allowed = vec![".pdf".to_string(), ".md".to_string()];

        assert!(parser.validate_file_type("doc.PDF", &allowed).is_ok());
        assert!(parser.validate_file_type("doc.md", &allowed).is_ok());
        assert!(parser.validate_file_type("doc.txt", &allowed).is_err());
        assert!(parser.validate_file_type("doc", &allowed).is_err());
    }

    #[test]
    fn empty_pdf_reports_parse_failure() {
        let parser = DocumentParser::new();
        let err = parser.parse("doc.pdf", b"not a pdf at all").unwrap_err();
        assert!(matches!(err, AppError::ParseFailed(_)));
    }
}
