#![deny(missing_docs)]
#![forbid(unsafe_code)]

//! Ragnar is a multi-tenant Retrieval-Augmented-Generation ingestion and
//! search service. Tenants organise documents into isolated collections
//! ("tubs"); uploads are converted to Markdown, split into chunks, embedded,
//! and served through a cosine-distance similarity search with a
//! header-filter DSL. The crate is organised along the data flow:
//!
//! * `config` and `logging` bootstrap the process.
//! * `api` is the axum HTTP surface: tub and document CRUD, uploads
//!   (single-file and multipart), downloads, status, and search.
//! * `store` is the Postgres metadata store: one schema per tub, JSONB
//!   header maps, and per-model pgvector columns on the chunk table.
//! * `blob` persists original bytes and derived Markdown in S3 with
//!   content-hash short-circuiting.
//! * `queue` and `pipeline` run the durable three-stage ingestion flow
//!   (convert → chunk → embed) with per-document task de-duplication.
//! * `convert`, `chunker`, and `embedding` are the stage workhorses.
//! * `filter` parses the header-filter DSL used by listings and search.

/// HTTP routing, middleware, and request handlers.
pub mod api;
/// Bearer and JWT authentication.
pub mod auth;
/// S3 blob storage for originals and Markdown renditions.
pub mod blob;
/// Settings-driven Markdown chunking.
pub mod chunker;
/// Command line and environment configuration.
pub mod config;
/// Document-to-Markdown conversion.
pub mod convert;
/// Embedding service client and document batching.
pub mod embedding;
/// Header-filter DSL.
pub mod filter;
/// Structured logging setup.
pub mod logging;
/// Core data records.
pub mod model;
/// Ingestion pipeline stages and workers.
pub mod pipeline;
/// Durable Postgres task queue.
pub mod queue;
/// Postgres metadata store.
pub mod store;
/// Shared helpers.
pub mod util;
