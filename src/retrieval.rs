//! Retrieval service: locate the right persisted index for a principal and
//! query scope, run a similarity search, and return ranked chunk texts.
//!
//! Scope resolution enforces ownership: an explicit document id must belong
//! to the principal; with no explicit scope the principal's most recently
//! uploaded document is used. A missing persisted index is `NotReady` (the
//! ingestion pipeline has not finished), not a corruption.

use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::error::{ChatError, Result};
use crate::index::{self, TfidfIndex};
use crate::models::Principal;

pub struct RetrievalService {
    pool: SqlitePool,
    index_root: PathBuf,
}

impl RetrievalService {
    pub fn new(pool: SqlitePool, index_root: &Path) -> Self {
        Self {
            pool,
            index_root: index_root.to_path_buf(),
        }
    }

    /// Resolve the index location for a principal and optional document
    /// scope.
    ///
    /// - explicit `document_id` not owned by the principal → `AccessDenied`
    /// - no scope and the principal has no documents → `Ok(None)`
    /// - resolved document without a persisted index → `NotReady`
    pub async fn resolve_index(
        &self,
        principal: &Principal,
        document_id: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        let doc_id = match document_id {
            Some(id) => {
                let owned: Option<String> =
                    sqlx::query_scalar("SELECT id FROM documents WHERE id = ? AND user_id = ?")
                        .bind(id)
                        .bind(&principal.user_id)
                        .fetch_optional(&self.pool)
                        .await?;
                owned.ok_or(ChatError::AccessDenied)?
            }
            None => {
                let latest: Option<String> = sqlx::query_scalar(
                    "SELECT id FROM documents WHERE user_id = ? ORDER BY uploaded_at DESC, id LIMIT 1",
                )
                .bind(&principal.user_id)
                .fetch_optional(&self.pool)
                .await?;
                match latest {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
        };

        let dir = index::index_dir(&self.index_root, &principal.user_id, &doc_id);
        if !TfidfIndex::exists(&dir) {
            return Err(ChatError::NotReady);
        }
        Ok(Some(dir))
    }

    /// Resolve, load, and search. Returns the top-`k` chunk texts ranked by
    /// similarity; scores are internal ranking detail. A principal with no
    /// documents gets an empty result, not an error.
    pub async fn search(
        &self,
        principal: &Principal,
        document_id: Option<&str>,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>> {
        let Some(dir) = self.resolve_index(principal, document_id).await? else {
            return Ok(Vec::new());
        };

        let index = TfidfIndex::load(&dir)?;
        let hits = index.search(query, k);

        tracing::debug!(
            user = %principal.user_id,
            scope = ?document_id,
            hits = hits.len(),
            "retrieval search"
        );

        Ok(hits.into_iter().map(|(text, _)| text.to_string()).collect())
    }
}
