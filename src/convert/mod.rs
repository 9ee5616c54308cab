//! Format conversion: registry, converters, and the conversion pipeline.
//!
//! A [`Converter`] turns raw bytes of one format family into markdown plus
//! a title hint and warnings. Converters never canonicalize — the pipeline
//! canonicalizes and hashes exactly once, after conversion, so every
//! converter produces hash-compatible output.
//!
//! Registration order is priority: the first converter whose `can_handle`
//! accepts the `(mime, ext)` pair wins.
//!
//! The [`ConversionPipeline`] enforces size limits, races the converter
//! against its timeout, and yields a [`ConversionArtifact`]. Converter
//! libraries cannot be interrupted, so on timeout the pipeline returns
//! `TIMEOUT` while the blocked worker may keep running in the background
//! (no process isolation here).

pub mod markdown;
pub mod office;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::canonical::canonicalize_and_hash;
use crate::config::LimitsConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::models::ConversionArtifact;

/// Input handed to a converter.
#[derive(Debug, Clone)]
pub struct ConvertInput {
    /// Path of the source file relative to its collection root.
    pub rel_path: String,
    pub bytes: Vec<u8>,
    pub mime: String,
    /// Extension without the leading dot, lowercase.
    pub ext: String,
    pub limits: LimitsConfig,
}

/// What a converter emits before canonicalization.
#[derive(Debug, Clone, Default)]
pub struct RawConversion {
    pub markdown: String,
    pub title: Option<String>,
    pub language_hint: Option<String>,
    pub warnings: Vec<String>,
}

pub trait Converter: Send + Sync {
    fn id(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn can_handle(&self, mime: &str, ext: &str) -> bool;
    fn convert(&self, input: &ConvertInput) -> Result<RawConversion>;
}

/// Ordered converter registry; first match wins.
pub struct ConverterRegistry {
    converters: Vec<Box<dyn Converter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self {
            converters: Vec::new(),
        }
    }

    /// All built-in converters, most specific first.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(markdown::MarkdownConverter));
        registry.register(Box::new(office::PdfConverter));
        registry.register(Box::new(office::DocxConverter));
        registry.register(Box::new(office::XlsxConverter));
        registry.register(Box::new(office::PptxConverter));
        registry.register(Box::new(markdown::PlainTextConverter));
        registry
    }

    pub fn register(&mut self, converter: Box<dyn Converter>) {
        self.converters.push(converter);
    }

    pub fn find(&self, mime: &str, ext: &str) -> Option<&dyn Converter> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.converters
            .iter()
            .find(|c| c.can_handle(mime, &ext))
            .map(|c| c.as_ref())
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Converts one file per call: select converter, run it under the
/// configured limits, canonicalize, hash.
pub struct ConversionPipeline {
    registry: Arc<ConverterRegistry>,
}

impl ConversionPipeline {
    pub fn new(registry: ConverterRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub async fn convert(&self, input: ConvertInput) -> Result<ConversionArtifact> {
        if input.bytes.len() as u64 > input.limits.max_bytes {
            return Err(Error::new(
                ErrorKind::TooLarge,
                format!(
                    "{} is {} bytes, limit is {}",
                    input.rel_path,
                    input.bytes.len(),
                    input.limits.max_bytes
                ),
            )
            .with_source(&input.rel_path, &input.mime, &input.ext)
            .with_fatal(true));
        }

        let converter = self.registry.find(&input.mime, &input.ext).ok_or_else(|| {
            Error::unsupported(format!(
                "no converter for mime {:?} ext {:?}",
                input.mime, input.ext
            ))
            .with_source(&input.rel_path, &input.mime, &input.ext)
        })?;
        let converter_id = converter.id().to_string();
        let converter_version = converter.version().to_string();

        let timeout = Duration::from_millis(input.limits.timeout_ms);
        let registry = Arc::clone(&self.registry);
        let source_mime = input.mime.clone();
        let rel_path = input.rel_path.clone();
        let ext = input.ext.clone();
        let id_for_task = converter_id.clone();

        let work = tokio::task::spawn_blocking(move || {
            let converter = registry
                .find(&input.mime, &input.ext)
                .expect("converter disappeared between find and run");
            debug_assert_eq!(converter.id(), id_for_task);
            converter.convert(&input)
        });

        let raw = match tokio::time::timeout(timeout, work).await {
            Ok(joined) => joined
                .map_err(|e| Error::internal(format!("converter task panicked: {}", e)))??,
            Err(_) => {
                // The blocking task keeps running; we only abandon the result.
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("conversion exceeded {} ms", timeout.as_millis()),
                )
                .with_converter(&converter_id)
                .with_source(&rel_path, &source_mime, &ext));
            }
        };

        let (canonical_markdown, mirror_hash) = canonicalize_and_hash(&raw.markdown);
        Ok(ConversionArtifact {
            canonical_markdown,
            mirror_hash,
            title: raw.title,
            language_hint: raw.language_hint,
            converter_id,
            converter_version,
            source_mime,
            warnings: raw.warnings,
        })
    }
}

static DEFAULT_PIPELINE: Mutex<Option<Arc<ConversionPipeline>>> = Mutex::new(None);

/// Process-wide pipeline with the default registry.
///
/// Lazily constructed; concurrent first callers share one instance.
pub fn default_pipeline() -> Arc<ConversionPipeline> {
    let mut guard = DEFAULT_PIPELINE.lock().expect("pipeline lock poisoned");
    guard
        .get_or_insert_with(|| Arc::new(ConversionPipeline::new(ConverterRegistry::with_defaults())))
        .clone()
}

/// Drop the process-wide pipeline so the next call rebuilds it.
pub fn reset_default_pipeline() {
    let mut guard = DEFAULT_PIPELINE.lock().expect("pipeline lock poisoned");
    *guard = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::{MIME_MARKDOWN, MIME_PLAIN};

    fn input(rel_path: &str, bytes: &[u8], mime: &str, ext: &str) -> ConvertInput {
        ConvertInput {
            rel_path: rel_path.to_string(),
            bytes: bytes.to_vec(),
            mime: mime.to_string(),
            ext: ext.to_string(),
            limits: LimitsConfig::default(),
        }
    }

    #[tokio::test]
    async fn markdown_end_to_end() {
        let pipeline = default_pipeline();
        let artifact = pipeline
            .convert(input(
                "notes/a.md",
                b"# Title\r\n\r\nBody text.\r\n",
                MIME_MARKDOWN,
                "md",
            ))
            .await
            .unwrap();
        assert_eq!(artifact.canonical_markdown, "# Title\n\nBody text.\n");
        assert_eq!(
            artifact.mirror_hash,
            crate::canonical::mirror_hash("# Title\n\nBody text.\n")
        );
        assert_eq!(artifact.title.as_deref(), Some("Title"));
        assert_eq!(artifact.converter_id, "markdown");
    }

    #[tokio::test]
    async fn registry_order_is_priority() {
        struct Grabby;
        impl Converter for Grabby {
            fn id(&self) -> &'static str {
                "grabby"
            }
            fn version(&self) -> &'static str {
                "1"
            }
            fn can_handle(&self, _mime: &str, _ext: &str) -> bool {
                true
            }
            fn convert(&self, _input: &ConvertInput) -> Result<RawConversion> {
                Ok(RawConversion {
                    markdown: "grabbed".into(),
                    ..Default::default()
                })
            }
        }
        let mut registry = ConverterRegistry::new();
        registry.register(Box::new(Grabby));
        registry.register(Box::new(markdown::MarkdownConverter));
        let pipeline = ConversionPipeline::new(registry);
        let artifact = pipeline
            .convert(input("x.md", b"# T", MIME_MARKDOWN, "md"))
            .await
            .unwrap();
        assert_eq!(artifact.converter_id, "grabby");
        assert_eq!(artifact.canonical_markdown, "grabbed\n");
    }

    #[tokio::test]
    async fn oversized_input_rejected() {
        let pipeline = default_pipeline();
        let mut i = input("big.txt", &[b'x'; 128], MIME_PLAIN, "txt");
        i.limits.max_bytes = 64;
        let err = pipeline.convert(i).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TooLarge);
        assert!(err.fatal);
    }

    #[tokio::test]
    async fn unknown_format_unsupported() {
        let pipeline = default_pipeline();
        let err = pipeline
            .convert(input("blob.bin", b"\x00\x01", "application/octet-stream", "bin"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn slow_converter_times_out() {
        struct Sleepy;
        impl Converter for Sleepy {
            fn id(&self) -> &'static str {
                "sleepy"
            }
            fn version(&self) -> &'static str {
                "1"
            }
            fn can_handle(&self, _mime: &str, _ext: &str) -> bool {
                true
            }
            fn convert(&self, _input: &ConvertInput) -> Result<RawConversion> {
                std::thread::sleep(Duration::from_millis(500));
                Ok(RawConversion::default())
            }
        }
        let mut registry = ConverterRegistry::new();
        registry.register(Box::new(Sleepy));
        let pipeline = ConversionPipeline::new(registry);
        let mut i = input("slow.txt", b"x", MIME_PLAIN, "txt");
        i.limits.timeout_ms = 20;
        let err = pipeline.convert(i).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.retryable);
        assert_eq!(err.converter_id.as_deref(), Some("sleepy"));
    }

    #[tokio::test]
    async fn default_pipeline_is_shared_and_resettable() {
        let a = default_pipeline();
        let b = default_pipeline();
        assert!(Arc::ptr_eq(&a, &b));
        reset_default_pipeline();
        let c = default_pipeline();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
