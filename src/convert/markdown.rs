//! Passthrough converters for markdown and plain text.

use super::{ConvertInput, Converter, RawConversion};
use crate::error::Result;

/// First `# ` heading outside code fences, if any.
fn title_from_heading(markdown: &str) -> Option<String> {
    let mut in_fence = false;
    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix("# ") {
            let title = heading.trim();
            if !title.is_empty() {
                return Some(title.to_string());
            }
        }
    }
    None
}

/// Filename without extension, as a last-resort title.
fn title_from_path(rel_path: &str) -> Option<String> {
    std::path::Path::new(rel_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn decode_text(input: &ConvertInput) -> (String, Vec<String>) {
    match std::str::from_utf8(&input.bytes) {
        Ok(s) => (s.to_string(), Vec::new()),
        Err(_) => (
            String::from_utf8_lossy(&input.bytes).into_owned(),
            vec!["invalid UTF-8 sequences replaced".to_string()],
        ),
    }
}

/// Markdown passthrough. The text is already markdown; only the title is
/// derived here.
pub struct MarkdownConverter;

impl Converter for MarkdownConverter {
    fn id(&self) -> &'static str {
        "markdown"
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn can_handle(&self, mime: &str, ext: &str) -> bool {
        mime == "text/markdown" || matches!(ext, "md" | "markdown" | "mdown")
    }

    fn convert(&self, input: &ConvertInput) -> Result<RawConversion> {
        let (markdown, warnings) = decode_text(input);
        let title = title_from_heading(&markdown).or_else(|| title_from_path(&input.rel_path));
        Ok(RawConversion {
            markdown,
            title,
            language_hint: None,
            warnings,
        })
    }
}

/// Plain-text passthrough; accepts any `text/*` not claimed earlier.
pub struct PlainTextConverter;

impl Converter for PlainTextConverter {
    fn id(&self) -> &'static str {
        "plaintext"
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn can_handle(&self, mime: &str, ext: &str) -> bool {
        mime.starts_with("text/") || matches!(ext, "txt" | "text" | "log")
    }

    fn convert(&self, input: &ConvertInput) -> Result<RawConversion> {
        let (markdown, warnings) = decode_text(input);
        Ok(RawConversion {
            markdown,
            title: title_from_path(&input.rel_path),
            language_hint: None,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;

    fn input(rel_path: &str, bytes: &[u8]) -> ConvertInput {
        ConvertInput {
            rel_path: rel_path.to_string(),
            bytes: bytes.to_vec(),
            mime: "text/markdown".to_string(),
            ext: "md".to_string(),
            limits: LimitsConfig::default(),
        }
    }

    #[test]
    fn title_from_first_heading() {
        let raw = MarkdownConverter
            .convert(&input("a.md", b"intro\n\n# Real Title\n\nbody"))
            .unwrap();
        assert_eq!(raw.title.as_deref(), Some("Real Title"));
    }

    #[test]
    fn heading_inside_fence_ignored() {
        let raw = MarkdownConverter
            .convert(&input("b.md", b"```\n# not a title\n```\n\n# Yes\n"))
            .unwrap();
        assert_eq!(raw.title.as_deref(), Some("Yes"));
    }

    #[test]
    fn falls_back_to_filename() {
        let raw = MarkdownConverter
            .convert(&input("notes/weekly-sync.md", b"no headings here"))
            .unwrap();
        assert_eq!(raw.title.as_deref(), Some("weekly-sync"));
    }

    #[test]
    fn plaintext_title_is_filename() {
        let raw = PlainTextConverter
            .convert(&input("logs/build output.txt", b"# looks like a heading"))
            .unwrap();
        assert_eq!(raw.title.as_deref(), Some("build output"));
    }

    #[test]
    fn invalid_utf8_is_replaced_with_warning() {
        let raw = MarkdownConverter
            .convert(&input("x.md", &[0x66, 0xff, 0x6f]))
            .unwrap();
        assert!(raw.markdown.contains('\u{fffd}'));
        assert_eq!(raw.warnings.len(), 1);
    }

    #[test]
    fn passthrough_does_not_canonicalize() {
        let raw = MarkdownConverter
            .convert(&input("x.md", b"line  \r\n\r\n\r\nnext"))
            .unwrap();
        // Raw output keeps CRLF and trailing spaces; the pipeline owns
        // canonicalization.
        assert!(raw.markdown.contains("\r\n"));
        assert!(raw.markdown.contains("line  "));
    }
}
