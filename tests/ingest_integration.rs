//! Ingestion pipeline integration tests: a successful run leaves a loadable
//! index plus chunk rows, and a failed run rolls back every artifact.

use std::path::PathBuf;
use tempfile::TempDir;

use docchat::config::{
    AuthConfig, ChunkingConfig, Config, DbConfig, GenerationConfig, RetrievalConfig, ServerConfig,
    StorageConfig,
};
use docchat::error::{ChatError, IngestStage};
use docchat::index::{self, TfidfIndex};
use docchat::{db, ingest, migrate};

fn test_config(root: &std::path::Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("data/docchat.sqlite"),
        },
        storage: StorageConfig {
            index_root: root.join("data/indexes"),
            upload_root: root.join("data/uploads"),
        },
        chunking: ChunkingConfig {
            chunk_size: 64,
            overlap: 8,
        },
        retrieval: RetrievalConfig::default(),
        auth: AuthConfig {
            secret: "test-secret".to_string(),
            token_ttl_secs: 3600,
        },
        generation: GenerationConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn setup() -> (TempDir, Config, sqlx::SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let pool = db::connect(&cfg.db.path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, cfg, pool)
}

#[tokio::test]
async fn successful_ingestion_persists_index_and_chunks() {
    let (_tmp, cfg, pool) = setup().await;

    let body = "Cats are mammals.\n\nDogs are mammals.\n\nRocket engines burn fuel.";
    let document = ingest::create_document(
        &pool,
        &cfg.storage.upload_root,
        "alice",
        "Animals",
        "animals.txt",
        body.as_bytes(),
    )
    .await
    .unwrap();

    // The uploaded file landed under the user's directory.
    assert!(PathBuf::from(&document.file_path).exists());

    let chunk_count = ingest::run_pipeline(&pool, &cfg, &document).await.unwrap();
    assert!(chunk_count > 0);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind(&document.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows as usize, chunk_count);

    let dir = index::index_dir(&cfg.storage.index_root, "alice", &document.id);
    assert!(TfidfIndex::exists(&dir));
    let index = TfidfIndex::load(&dir).unwrap();
    assert_eq!(index.len(), chunk_count);
}

#[tokio::test]
async fn failed_ingestion_rolls_back_all_state() {
    let (_tmp, cfg, pool) = setup().await;

    // Unsupported extension fails at the extract stage.
    let document = ingest::create_document(
        &pool,
        &cfg.storage.upload_root,
        "alice",
        "Broken",
        "broken.xyz",
        b"some bytes",
    )
    .await
    .unwrap();

    let err = ingest::run_pipeline(&pool, &cfg, &document).await.unwrap_err();
    assert!(matches!(
        err,
        ChatError::Ingestion {
            stage: IngestStage::Extract,
            ..
        }
    ));

    ingest::rollback(&pool, &cfg.storage.index_root, &document).await;

    let doc_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE id = ?")
        .bind(&document.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(doc_rows, 0);

    let chunk_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind(&document.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(chunk_rows, 0);

    assert!(!PathBuf::from(&document.file_path).exists());
    let dir = index::index_dir(&cfg.storage.index_root, "alice", &document.id);
    assert!(!TfidfIndex::exists(&dir));
}

#[tokio::test]
async fn blank_document_fails_and_rolls_back() {
    let (_tmp, cfg, pool) = setup().await;

    let document = ingest::create_document(
        &pool,
        &cfg.storage.upload_root,
        "alice",
        "Blank",
        "blank.txt",
        b"   \n\n  ",
    )
    .await
    .unwrap();

    let err = ingest::run_pipeline(&pool, &cfg, &document).await.unwrap_err();
    assert!(matches!(err, ChatError::Ingestion { .. }));

    ingest::rollback(&pool, &cfg.storage.index_root, &document).await;

    let doc_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE id = ?")
        .bind(&document.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(doc_rows, 0);
}

#[tokio::test]
async fn background_queue_completes_ingestion() {
    let (_tmp, cfg, pool) = setup().await;

    let document = ingest::create_document(
        &pool,
        &cfg.storage.upload_root,
        "alice",
        "Animals",
        "animals.txt",
        b"Cats are mammals.\n\nDogs are mammals.",
    )
    .await
    .unwrap();

    let queue = ingest::IngestQueue::start(pool.clone(), cfg.clone());
    queue.enqueue(document.clone()).await.unwrap();

    // The upload path returns before the index exists; poll for readiness.
    let dir = index::index_dir(&cfg.storage.index_root, "alice", &document.id);
    for _ in 0..100 {
        if TfidfIndex::exists(&dir) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(TfidfIndex::exists(&dir));
    TfidfIndex::load(&dir).unwrap();
}
