//! # Gnosis
//!
//! **A local-first knowledge retrieval core: content-addressed indexing
//! with hybrid lexical + semantic search.**
//!
//! Gnosis ingests heterogeneous documents (markdown, plain text, PDF,
//! OOXML), normalizes them to canonical markdown, stores them in a
//! content-addressed SQLite index (FTS5 + sqlite-vec), and answers
//! queries through a fused BM25 + vector pipeline with cross-encoder
//! reranking.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Discovered  │──▶│  Conversion   │──▶│    SQLite      │
//! │   files     │   │ + Canonical-  │   │ content/chunks │
//! │ (collabora- │   │   ization     │   │ FTS5 + vec0    │
//! │    tor)     │   └──────────────┘   └───────┬───────┘
//! └─────────────┘                              │
//!                    ┌─────────────────────────┤
//!                    ▼                         ▼
//!              ┌───────────┐            ┌───────────┐
//!              │  Embedding │            │   Hybrid   │
//!              │  backlog   │            │   search   │
//!              └───────────┘            └───────────┘
//! ```
//!
//! ## Write path
//!
//! 1. The host discovers `(collection, rel_path, bytes, mtime, size)`
//!    tuples and calls [`engine::Engine::ingest`].
//! 2. [`mime`] sniffs the format; the [`convert`] pipeline picks a
//!    converter, extracts markdown, then canonicalizes and hashes it
//!    ([`canonical`]) into a `mirror_hash` — the content-addressed key.
//! 3. The [`store`] upserts the document, content, [`chunk`]s, FTS rows,
//!    and parsed [`links`] in one transaction.
//! 4. The [`embed_backlog`] processor walks unembedded chunks in
//!    cursor-paginated batches and fills the [`vec_index`].
//!
//! ## Read path
//!
//! 1. [`expand`] turns the query into lexical variants, semantic
//!    rephrasings, and a HyDE passage (identity fallback when no
//!    generator is attached).
//! 2. [`search`] runs BM25 and k-NN retrieval per variant.
//! 3. [`fusion`] merges candidate lists with RRF (`k = 60`) and blends
//!    cross-encoder scores (`α = 0.7`); reranker failure degrades to
//!    pure RRF.
//! 4. [`graph`] adds link, backlink, and similar-document lookups.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`canonical`] | Text canonicalization rules and SHA-256 content hashing |
//! | [`mime`] | Magic-byte MIME detection with extension fallback |
//! | [`convert`] | Converter registry, format adapters, conversion pipeline |
//! | [`chunk`] | Positional, fence-aware chunker |
//! | [`links`] | Wiki and markdown link extraction |
//! | [`store`] | Content-addressed SQLite persistence (documents, content, chunks, FTS, links) |
//! | [`vec_index`] | sqlite-vec side-index with dirty tracking and reconciliation |
//! | [`embed_backlog`] | Cursor-paginated backlog embedding |
//! | [`model`] | Embedder/reranker/generator ports + OpenAI-compatible HTTP adapter |
//! | [`expand`] | Schema-validated query expansion with identity fallback |
//! | [`search`] | BM25 and vector retrieval stages |
//! | [`fusion`] | Reciprocal Rank Fusion and rerank blending |
//! | [`graph`] | Links, backlinks, similar-document accessors |
//! | [`ingest`] | Per-file write-path orchestration |
//! | [`engine`] | Public operations facade |
//! | [`config`] | TOML configuration and directory resolution |
//! | [`error`] | Stable error taxonomy |
//!
//! ## Identity
//!
//! - Documents live at `gno://<collection>/<rel_path>` and carry a stable
//!   short id (`#` + 8 hex chars) derived from that pair.
//! - Canonical text is keyed by `mirror_hash = SHA256(canonical bytes)`;
//!   identical documents share storage, chunks, and vectors.

pub mod canonical;
pub mod chunk;
pub mod config;
pub mod convert;
pub mod db;
pub mod embed_backlog;
pub mod engine;
pub mod error;
pub mod expand;
pub mod fusion;
pub mod graph;
pub mod ingest;
pub mod links;
pub mod migrate;
pub mod mime;
pub mod model;
pub mod models;
pub mod search;
pub mod store;
pub mod vec_index;

pub use engine::{Engine, QueryOptions, SearchOptions};
pub use error::{Error, ErrorKind, Result};
pub use models::{ConversionArtifact, Document, SearchHit};
pub use store::Store;
