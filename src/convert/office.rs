//! Structured-document converters: PDF and the OOXML family.
//!
//! OOXML containers are ZIP archives of XML parts. Extraction reads only
//! the text-bearing parts, with hard byte bounds on decompressed entries
//! so a hostile archive cannot balloon memory.

use std::io::{Cursor, Read};

use quick_xml::events::Event;

use super::{ConvertInput, Converter, RawConversion};
use crate::error::{Error, ErrorKind, Result};

/// Decompressed cap per ZIP entry.
const MAX_PART_BYTES: u64 = 50 * 1024 * 1024;
/// Sheets read from a workbook before truncating with a warning.
const MAX_SHEETS: usize = 100;
/// Cells read per sheet before truncating with a warning.
const MAX_CELLS_PER_SHEET: usize = 100_000;

fn corrupt(what: &str, detail: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::Corrupt, format!("{}: {}", what, detail))
}

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| corrupt("not a readable archive", e))
}

fn read_part(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| corrupt(&format!("missing part {}", name), e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_PART_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| corrupt(&format!("reading part {}", name), e))?;
    if out.len() as u64 >= MAX_PART_BYTES {
        return Err(Error::new(
            ErrorKind::TooLarge,
            format!("part {} exceeds {} bytes decompressed", name, MAX_PART_BYTES),
        ));
    }
    Ok(out)
}

/// Collect the text of every `<prefix:tag>` element, grouping runs into
/// paragraphs whenever `para_tag` closes.
fn collect_text_runs(xml: &[u8], text_tag: &[u8], para_tag: &[u8]) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == text_tag => in_text = true,
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == text_tag {
                    in_text = false;
                } else if name.as_ref() == para_tag {
                    let para = current.trim();
                    if !para.is_empty() {
                        paragraphs.push(para.to_string());
                    }
                    current.clear();
                }
            }
            Ok(Event::Text(t)) if in_text => {
                current.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt("malformed XML", e)),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs)
}

/// Numbered parts like `ppt/slides/slide7.xml`, sorted by their number.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

pub struct PdfConverter;

impl Converter for PdfConverter {
    fn id(&self) -> &'static str {
        "pdf"
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn can_handle(&self, mime: &str, ext: &str) -> bool {
        mime == crate::mime::MIME_PDF || ext == "pdf"
    }

    fn convert(&self, input: &ConvertInput) -> Result<RawConversion> {
        let text = pdf_extract::extract_text_from_mem(&input.bytes)
            .map_err(|e| corrupt("pdf extraction failed", e))?;
        let mut warnings = Vec::new();
        if text.trim().is_empty() {
            warnings.push("pdf contained no extractable text".to_string());
        }
        Ok(RawConversion {
            markdown: text,
            title: None,
            language_hint: None,
            warnings,
        })
    }
}

pub struct DocxConverter;

impl Converter for DocxConverter {
    fn id(&self) -> &'static str {
        "docx"
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn can_handle(&self, mime: &str, ext: &str) -> bool {
        mime == crate::mime::MIME_DOCX || ext == "docx"
    }

    fn convert(&self, input: &ConvertInput) -> Result<RawConversion> {
        let mut archive = open_archive(&input.bytes)?;
        let xml = read_part(&mut archive, "word/document.xml")?;
        let paragraphs = collect_text_runs(&xml, b"t", b"p")?;
        let title = paragraphs.first().cloned();
        Ok(RawConversion {
            markdown: paragraphs.join("\n\n"),
            title,
            language_hint: None,
            warnings: Vec::new(),
        })
    }
}

pub struct PptxConverter;

impl Converter for PptxConverter {
    fn id(&self) -> &'static str {
        "pptx"
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn can_handle(&self, mime: &str, ext: &str) -> bool {
        mime == crate::mime::MIME_PPTX || ext == "pptx"
    }

    fn convert(&self, input: &ConvertInput) -> Result<RawConversion> {
        let mut archive = open_archive(&input.bytes)?;
        let slides = numbered_parts(&archive, "ppt/slides/slide");
        if slides.is_empty() {
            return Err(corrupt("presentation has no slides", "ppt/slides empty"));
        }
        let mut sections = Vec::new();
        for (i, name) in slides.iter().enumerate() {
            let xml = read_part(&mut archive, name)?;
            let runs = collect_text_runs(&xml, b"t", b"p")?;
            if !runs.is_empty() {
                sections.push(format!("## Slide {}\n\n{}", i + 1, runs.join("\n\n")));
            }
        }
        Ok(RawConversion {
            markdown: sections.join("\n\n"),
            title: None,
            language_hint: None,
            warnings: Vec::new(),
        })
    }
}

pub struct XlsxConverter;

impl XlsxConverter {
    fn shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>> {
        if !archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
            return Ok(Vec::new());
        }
        let xml = read_part(archive, "xl/sharedStrings.xml")?;
        // Each <si> may hold several <t> runs (rich text); they concatenate
        // into one shared string.
        let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
        let mut buf = Vec::new();
        let mut strings = Vec::new();
        let mut current = String::new();
        let mut in_t = false;
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => match e.local_name().as_ref() {
                    b"si" => current.clear(),
                    b"t" => in_t = true,
                    _ => {}
                },
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"si" => strings.push(current.clone()),
                    b"t" => in_t = false,
                    _ => {}
                },
                Ok(Event::Text(t)) if in_t => {
                    current.push_str(t.unescape().unwrap_or_default().as_ref());
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(corrupt("malformed sharedStrings.xml", e)),
                _ => {}
            }
            buf.clear();
        }
        Ok(strings)
    }

    fn sheet_cells(xml: &[u8], shared: &[String], warnings: &mut Vec<String>) -> Result<Vec<String>> {
        let mut reader = quick_xml::Reader::from_reader(xml);
        let mut buf = Vec::new();
        let mut cells = Vec::new();
        let mut in_value = false;
        let mut is_shared = false;
        loop {
            if cells.len() >= MAX_CELLS_PER_SHEET {
                warnings.push(format!("sheet truncated at {} cells", MAX_CELLS_PER_SHEET));
                break;
            }
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => match e.local_name().as_ref() {
                    b"c" => {
                        is_shared = e.attributes().any(|a| {
                            a.as_ref()
                                .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                                .unwrap_or(false)
                        });
                    }
                    b"v" => in_value = true,
                    _ => {}
                },
                Ok(Event::Text(t)) if in_value => {
                    let v = t.unescape().unwrap_or_default();
                    let v = v.trim();
                    if !v.is_empty() {
                        if is_shared {
                            if let Some(s) = v.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                                if !s.trim().is_empty() {
                                    cells.push(s.trim().to_string());
                                }
                            }
                        } else {
                            cells.push(v.to_string());
                        }
                    }
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"v" => in_value = false,
                    b"c" => is_shared = false,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(corrupt("malformed worksheet XML", e)),
                _ => {}
            }
            buf.clear();
        }
        Ok(cells)
    }
}

impl Converter for XlsxConverter {
    fn id(&self) -> &'static str {
        "xlsx"
    }

    fn version(&self) -> &'static str {
        "1.0"
    }

    fn can_handle(&self, mime: &str, ext: &str) -> bool {
        mime == crate::mime::MIME_XLSX || ext == "xlsx"
    }

    fn convert(&self, input: &ConvertInput) -> Result<RawConversion> {
        let mut archive = open_archive(&input.bytes)?;
        let shared = Self::shared_strings(&mut archive)?;
        let sheets = numbered_parts(&archive, "xl/worksheets/sheet");
        if sheets.is_empty() {
            return Err(corrupt("workbook has no worksheets", "xl/worksheets empty"));
        }

        let mut warnings = Vec::new();
        if sheets.len() > MAX_SHEETS {
            warnings.push(format!(
                "workbook has {} sheets, reading first {}",
                sheets.len(),
                MAX_SHEETS
            ));
        }

        let mut sections = Vec::new();
        for (i, name) in sheets.iter().take(MAX_SHEETS).enumerate() {
            let xml = read_part(&mut archive, name)?;
            let cells = Self::sheet_cells(&xml, &shared, &mut warnings)?;
            if !cells.is_empty() {
                sections.push(format!("## Sheet {}\n\n{}", i + 1, cells.join("\n")));
            }
        }
        Ok(RawConversion {
            markdown: sections.join("\n\n"),
            title: None,
            language_hint: None,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn input(bytes: Vec<u8>, mime: &str, ext: &str) -> ConvertInput {
        ConvertInput {
            rel_path: format!("doc.{}", ext),
            bytes,
            mime: mime.to_string(),
            ext: ext.to_string(),
            limits: LimitsConfig::default(),
        }
    }

    fn build_zip(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            for (name, content) in parts {
                writer
                    .start_file(name.to_string(), SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn invalid_pdf_is_corrupt() {
        let err = PdfConverter
            .convert(&input(b"not a pdf".to_vec(), crate::mime::MIME_PDF, "pdf"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
        assert!(!err.retryable);
    }

    #[test]
    fn invalid_zip_is_corrupt_for_docx() {
        let err = DocxConverter
            .convert(&input(b"not a zip".to_vec(), crate::mime::MIME_DOCX, "docx"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }

    #[test]
    fn docx_paragraphs_become_markdown_paragraphs() {
        let doc = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Quarterly Report</w:t></w:r></w:p>
    <w:p><w:r><w:t>Revenue grew </w:t></w:r><w:r><w:t>ten percent.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let bytes = build_zip(&[("word/document.xml", doc)]);
        let raw = DocxConverter
            .convert(&input(bytes, crate::mime::MIME_DOCX, "docx"))
            .unwrap();
        assert_eq!(
            raw.markdown,
            "Quarterly Report\n\nRevenue grew ten percent."
        );
        assert_eq!(raw.title.as_deref(), Some("Quarterly Report"));
    }

    #[test]
    fn docx_without_document_part_is_corrupt() {
        let bytes = build_zip(&[("word/other.xml", "<x/>")]);
        let err = DocxConverter
            .convert(&input(bytes, crate::mime::MIME_DOCX, "docx"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }

    #[test]
    fn pptx_slides_in_numeric_order() {
        let slide = |text: &str| {
            format!(
                r#"<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"
xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main">
<a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#,
                text
            )
        };
        let s1 = slide("First slide");
        let s2 = slide("Second slide");
        let s10 = slide("Tenth slide");
        // Insertion order scrambled on purpose.
        let bytes = build_zip(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
        ]);
        let raw = PptxConverter
            .convert(&input(bytes, crate::mime::MIME_PPTX, "pptx"))
            .unwrap();
        let first = raw.markdown.find("First slide").unwrap();
        let second = raw.markdown.find("Second slide").unwrap();
        let tenth = raw.markdown.find("Tenth slide").unwrap();
        assert!(first < second && second < tenth);
        assert!(raw.markdown.starts_with("## Slide 1"));
    }

    #[test]
    fn xlsx_shared_and_inline_cells() {
        let shared = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<si><t>Region</t></si><si><t>North</t></si></sst>"#;
        let sheet = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<sheetData>
<row><c t="s"><v>0</v></c><c t="s"><v>1</v></c><c><v>42</v></c></row>
</sheetData></worksheet>"#;
        let bytes = build_zip(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let raw = XlsxConverter
            .convert(&input(bytes, crate::mime::MIME_XLSX, "xlsx"))
            .unwrap();
        assert!(raw.markdown.contains("Region"));
        assert!(raw.markdown.contains("North"));
        assert!(raw.markdown.contains("42"));
    }

    #[test]
    fn xlsx_without_shared_strings_still_reads_inline_values() {
        let sheet = r#"<worksheet><sheetData><row><c><v>7</v></c></row></sheetData></worksheet>"#;
        let bytes = build_zip(&[("xl/worksheets/sheet1.xml", sheet)]);
        let raw = XlsxConverter
            .convert(&input(bytes, crate::mime::MIME_XLSX, "xlsx"))
            .unwrap();
        assert!(raw.markdown.contains('7'));
    }
}
