//! Core data models used throughout docchat.
//!
//! These types represent the documents, chunks, and principals that flow
//! through the ingestion and retrieval pipeline.

use serde::Serialize;

/// Authenticated identity on whose behalf documents and queries are scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

/// Uploaded document stored in SQLite. Owned exclusively by `user_id`.
///
/// A document row only survives ingestion if its index was built and
/// persisted; a failed ingestion deletes the row and everything under it.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub title: String,
    /// Location of the raw uploaded bytes on disk.
    pub file_path: String,
    /// Unix timestamp of the upload.
    pub uploaded_at: i64,
}

/// A bounded span of a document's extracted text, indexed independently.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}
