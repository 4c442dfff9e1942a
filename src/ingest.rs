//! Ingestion pipeline orchestration.
//!
//! Coordinates the per-document flow: extract → chunk → index. Ingestion
//! runs as supervised background work decoupled from the upload request:
//! the upload boundary enqueues a document and returns immediately, while
//! a worker task drives the pipeline and observes its outcome. A failure
//! at any stage rolls back everything the run created (chunk rows, the
//! document row, the uploaded file, and any partial index directory) so
//! no partial state is ever visible to readers.
//!
//! An index only becomes readable once `persist` has renamed both
//! artifacts into place; until then retrieval reports `NotReady`.

use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chunk::chunk_pages;
use crate::config::Config;
use crate::error::{ChatError, IngestStage, Result};
use crate::extract::extract_pages;
use crate::index::{self, TfidfIndex};
use crate::models::{Chunk, Document};

/// Handle to the background ingestion worker.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<Document>,
}

impl IngestQueue {
    /// Spawn the worker task and return the queue handle. The worker owns
    /// every document it dequeues until the run reaches ready or failed;
    /// a failed run triggers rollback before the next document is taken.
    pub fn start(pool: SqlitePool, config: Config) -> Self {
        let (tx, mut rx) = mpsc::channel::<Document>(64);

        tokio::spawn(async move {
            while let Some(document) = rx.recv().await {
                let doc_id = document.id.clone();
                match run_pipeline(&pool, &config, &document).await {
                    Ok(chunk_count) => {
                        tracing::info!(document = %doc_id, chunks = chunk_count, "ingestion ready");
                    }
                    Err(e) => {
                        tracing::error!(
                            document = %doc_id,
                            user = %document.user_id,
                            error = %e,
                            "ingestion failed; rolling back"
                        );
                        rollback(&pool, &config.storage.index_root, &document).await;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Hand a freshly uploaded document to the worker. Returns as soon as
    /// the job is queued.
    pub async fn enqueue(&self, document: Document) -> anyhow::Result<()> {
        self.tx
            .send(document)
            .await
            .map_err(|_| anyhow::anyhow!("ingestion worker is not running"))
    }
}

/// Run the full pipeline for one document: extract page texts, split them
/// into chunk records, store the chunks, then build and persist the index.
/// Returns the number of chunks indexed.
pub async fn run_pipeline(pool: &SqlitePool, config: &Config, document: &Document) -> Result<usize> {
    let stage_err = |stage: IngestStage, cause: String| ChatError::Ingestion { stage, cause };

    // Extract. PDF parsing is CPU-bound, so it runs off the async runtime.
    let bytes = tokio::fs::read(&document.file_path)
        .await
        .map_err(|e| stage_err(IngestStage::Extract, e.to_string()))?;
    let filename = document.file_path.clone();
    let pages = tokio::task::spawn_blocking(move || extract_pages(&bytes, &filename))
        .await
        .map_err(|e| stage_err(IngestStage::Extract, e.to_string()))??;

    // Chunk.
    let chunks = chunk_pages(
        &document.id,
        &pages,
        config.chunking.chunk_size,
        config.chunking.overlap,
    );
    if chunks.is_empty() {
        return Err(stage_err(
            IngestStage::Chunk,
            "document produced no chunks".to_string(),
        ));
    }
    insert_chunks(pool, &chunks).await?;

    // Index.
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let index = TfidfIndex::build(texts, config.retrieval.max_vocab)
        .map_err(|e| stage_err(IngestStage::Index, e.to_string()))?;

    let dir = index::index_dir(
        &config.storage.index_root,
        &document.user_id,
        &document.id,
    );
    index
        .persist(&dir)
        .map_err(|e| stage_err(IngestStage::Index, e.to_string()))?;

    Ok(chunks.len())
}

/// Delete everything a failed ingestion run created. Best-effort: each
/// step is attempted even if an earlier one fails, so retries of rollback
/// are never needed.
pub async fn rollback(pool: &SqlitePool, index_root: &Path, document: &Document) {
    let dir = index::index_dir(index_root, &document.user_id, &document.id);
    if dir.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove index dir");
        }
    }

    // Chunk rows cascade with the document row.
    if let Err(e) = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(&document.id)
        .execute(pool)
        .await
    {
        tracing::warn!(document = %document.id, error = %e, "failed to delete document row");
    }

    if let Err(e) = tokio::fs::remove_file(&document.file_path).await {
        tracing::warn!(path = %document.file_path, error = %e, "failed to remove uploaded file");
    }
}

/// Insert all chunk rows for a document in one transaction.
async fn insert_chunks(pool: &SqlitePool, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Store uploaded bytes and create the document row. The caller decides
/// whether ingestion runs inline (CLI) or via the queue (upload boundary).
pub async fn create_document(
    pool: &SqlitePool,
    upload_root: &Path,
    user_id: &str,
    title: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<Document> {
    let doc_id = Uuid::new_v4().to_string();

    let user_dir: PathBuf = upload_root.join(user_id);
    tokio::fs::create_dir_all(&user_dir).await?;

    // Keep the original extension so extraction can infer the format.
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    let file_path = user_dir.join(format!("{}.{}", doc_id, ext));
    tokio::fs::write(&file_path, bytes).await?;

    let document = Document {
        id: doc_id,
        user_id: user_id.to_string(),
        title: title.to_string(),
        file_path: file_path.display().to_string(),
        uploaded_at: chrono::Utc::now().timestamp(),
    };

    sqlx::query(
        "INSERT INTO documents (id, user_id, title, file_path, uploaded_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&document.id)
    .bind(&document.user_id)
    .bind(&document.title)
    .bind(&document.file_path)
    .bind(document.uploaded_at)
    .execute(pool)
    .await?;

    Ok(document)
}
