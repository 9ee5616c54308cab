//! MIME detection: magic-byte sniffing with extension fallback.
//!
//! Detection priority:
//!
//! 1. Pure sniff — `%PDF-` prefix, or ZIP magic with a non-OOXML extension.
//! 2. Sniff + extension — ZIP magic with `.docx`/`.pptx`/`.xlsx`.
//! 3. Extension table fallback.
//! 4. `application/octet-stream`.
//!
//! Extension comparison is case-insensitive.

pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PLAIN: &str = "text/plain";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_ZIP: &str = "application/zip";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    Sniff,
    SniffExt,
    Extension,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct MimeDetection {
    pub mime: String,
    pub confidence: Confidence,
    pub method: DetectionMethod,
}

fn ooxml_mime_for_ext(ext: &str) -> Option<&'static str> {
    match ext {
        "docx" => Some(MIME_DOCX),
        "pptx" => Some(MIME_PPTX),
        "xlsx" => Some(MIME_XLSX),
        _ => None,
    }
}

fn mime_for_ext(ext: &str) -> Option<&'static str> {
    match ext {
        "md" | "markdown" | "mdown" => Some(MIME_MARKDOWN),
        "txt" | "text" | "log" => Some(MIME_PLAIN),
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        "pptx" => Some(MIME_PPTX),
        "xlsx" => Some(MIME_XLSX),
        "zip" => Some(MIME_ZIP),
        "html" | "htm" => Some("text/html"),
        "json" => Some("application/json"),
        "csv" => Some("text/csv"),
        _ => None,
    }
}

/// Detect the MIME type of a byte stream.
///
/// `ext` is the file extension without the leading dot; it may be empty.
pub fn detect_mime(bytes: &[u8], ext: &str) -> MimeDetection {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();

    if bytes.starts_with(PDF_MAGIC) {
        return MimeDetection {
            mime: MIME_PDF.to_string(),
            confidence: Confidence::High,
            method: DetectionMethod::Sniff,
        };
    }

    if bytes.starts_with(ZIP_MAGIC) {
        // OOXML containers are ZIP archives; the extension disambiguates.
        if let Some(mime) = ooxml_mime_for_ext(&ext) {
            return MimeDetection {
                mime: mime.to_string(),
                confidence: Confidence::High,
                method: DetectionMethod::SniffExt,
            };
        }
        return MimeDetection {
            mime: MIME_ZIP.to_string(),
            confidence: Confidence::High,
            method: DetectionMethod::Sniff,
        };
    }

    if let Some(mime) = mime_for_ext(&ext) {
        return MimeDetection {
            mime: mime.to_string(),
            confidence: Confidence::Medium,
            method: DetectionMethod::Extension,
        };
    }

    MimeDetection {
        mime: MIME_OCTET_STREAM.to_string(),
        confidence: Confidence::Low,
        method: DetectionMethod::Fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_magic_wins_over_extension() {
        let d = detect_mime(b"%PDF-1.7 rest", "txt");
        assert_eq!(d.mime, MIME_PDF);
        assert_eq!(d.confidence, Confidence::High);
        assert_eq!(d.method, DetectionMethod::Sniff);
    }

    #[test]
    fn zip_magic_with_docx_extension() {
        let d = detect_mime(b"PK\x03\x04rest-of-archive", ".docx");
        assert_eq!(d.mime, MIME_DOCX);
        assert_eq!(d.confidence, Confidence::High);
        assert_eq!(d.method, DetectionMethod::SniffExt);
    }

    #[test]
    fn zip_magic_with_unknown_extension_is_generic_zip() {
        let d = detect_mime(b"PK\x03\x04data", "bin");
        assert_eq!(d.mime, MIME_ZIP);
        assert_eq!(d.method, DetectionMethod::Sniff);
    }

    #[test]
    fn extension_fallback() {
        let d = detect_mime(b"# heading", "md");
        assert_eq!(d.mime, MIME_MARKDOWN);
        assert_eq!(d.confidence, Confidence::Medium);
        assert_eq!(d.method, DetectionMethod::Extension);
    }

    #[test]
    fn extension_is_case_insensitive() {
        let d = detect_mime(b"text", "TXT");
        assert_eq!(d.mime, MIME_PLAIN);
        let d = detect_mime(b"PK\x03\x04x", "DOCX");
        assert_eq!(d.mime, MIME_DOCX);
    }

    #[test]
    fn unknown_everything_is_octet_stream() {
        let d = detect_mime(b"\x00\x01\x02", "xyz");
        assert_eq!(d.mime, MIME_OCTET_STREAM);
        assert_eq!(d.confidence, Confidence::Low);
        assert_eq!(d.method, DetectionMethod::Fallback);
    }
}
