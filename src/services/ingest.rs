//! Document ingestion service
//!
//! Orchestrates the upload pipeline: pre-checks, content-hash dedup,
//! parsing, chunking under the index timeout, vector insert, and the
//! doc_count bookkeeping, all inside one relational transaction. Also owns
//! the delete cascades.

use crate::chunker::{ChunkMetadata, DocumentChunk, DocumentChunker};
use crate::config::SharedConfig;
use crate::db::models::Document;
use crate::db::Repository;
use crate::errors::{AppError, Result};
use crate::parser::DocumentParser;
use crate::vector::VectorIndex;
use sea_orm::DatabaseTransaction;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct DocumentService {
    repo: Repository,
    parser: DocumentParser,
    vector: Arc<VectorIndex>,
    config: SharedConfig,
}

impl DocumentService {
    pub fn new(
        repo: Repository,
        parser: DocumentParser,
        vector: Arc<VectorIndex>,
        config: SharedConfig,
    ) -> Self {
        Self {
            repo,
            parser,
            vector,
            config,
        }
    }

    /// Upload a document into a knowledge base. Returns the stored document
    /// and the number of chunks indexed.
    #[instrument(skip(self, content))]
    pub async fn upload_document(
        &self,
        filename: &str,
        content: Vec<u8>,
        kb_id: i64,
        user_id: i64,
    ) -> Result<(Document, usize)> {
        let config = self.config.snapshot().await;

        // Pre-checks, in order; nothing below has side effects until the
        // transaction opens
        if !self.vector.is_connected().await {
            return Err(AppError::VectorUnavailable);
        }

        self.repo
            .find_knowledge_base(kb_id)
            .await?
            .ok_or_else(|| AppError::not_found("knowledge base", kb_id))?;

        self.parser
            .validate_file_type(filename, &config.allowed_types())?;

        // Cap the body; callers enforce content-length separately
        let mut data = content;
        data.truncate(config.max_upload_size);

        let content_hash = hex::encode(Sha256::digest(&data));
        if self
            .repo
            .find_document_by_hash(kb_id, &content_hash)
            .await?
            .is_some()
        {
            return Err(AppError::Duplicate(
                "document already exists in this knowledge base".to_string(),
            ));
        }

        let text = self.parser.parse(filename, &data)?;

        info!(
            filename,
            kb_id,
            file_size = data.len(),
            text_length = text.len(),
            "Starting document indexing"
        );

        let txn = self.repo.begin().await?;
        let result = self
            .index_document(&txn, &config, filename, &data, &text, content_hash, kb_id, user_id)
            .await;

        match result {
            Ok((document, chunk_count)) => {
                txn.commit().await?;
                info!(
                    filename,
                    kb_id,
                    doc_id = document.id,
                    chunks = chunk_count,
                    "Document uploaded successfully"
                );
                Ok((document, chunk_count))
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "Transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// The transactional part of an upload: document row, chunks, vectors,
    /// doc_count
    #[allow(clippy::too_many_arguments)]
    async fn index_document(
        &self,
        txn: &DatabaseTransaction,
        config: &crate::config::AppConfig,
        filename: &str,
        data: &[u8],
        text: &str,
        content_hash: String,
        kb_id: i64,
        user_id: i64,
    ) -> Result<(Document, usize)> {
        let document = self
            .repo
            .insert_document(
                txn,
                kb_id,
                filename.to_string(),
                data.len() as i64,
                content_hash,
                user_id,
            )
            .await?;

        // Chunking runs on a worker so the index timeout can abandon it
        let chunks = self
            .chunk_with_timeout(config, text, filename, kb_id, document.id, user_id)
            .await?;
        let chunk_count = chunks.len();

        info!(filename, doc_id = document.id, chunk_count, "Starting vector indexing");
        self.vector.insert(&chunks, kb_id, document.id).await?;

        let affected = self.repo.adjust_doc_count(txn, kb_id, 1).await?;
        if affected == 0 {
            return Err(AppError::not_found("knowledge base", kb_id));
        }

        Ok((document, chunk_count))
    }

    async fn chunk_with_timeout(
        &self,
        config: &crate::config::AppConfig,
        text: &str,
        filename: &str,
        kb_id: i64,
        doc_id: i64,
        user_id: i64,
    ) -> Result<Vec<DocumentChunk>> {
        let chunker = DocumentChunker::new(
            config.chunk_size,
            config.chunk_overlap,
            config.chunking_strategy,
        );
        let metadata = ChunkMetadata {
            file_name: filename.to_string(),
            kb_id,
            doc_id,
            user_id,
        };
        let text = text.to_string();

        let worker = tokio::task::spawn_blocking(move || chunker.process(&text, metadata));

        match tokio::time::timeout(config.index_timeout(), worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AppError::Internal(format!("chunking task failed: {join_err}"))),
            Err(_) => Err(AppError::IndexTimeout {
                timeout_secs: config.index_timeout,
            }),
        }
    }

    /// Delete a document and its vectors, keeping `doc_count` in step.
    /// The vector delete is best-effort: relational state is authoritative
    /// for visibility, so a down adapter does not block the delete.
    pub async fn delete_document(&self, doc_id: i64) -> Result<()> {
        let document = self
            .repo
            .find_document(doc_id)
            .await?
            .ok_or_else(|| AppError::not_found("document", doc_id))?;

        let txn = self.repo.begin().await?;

        if self.vector.is_connected().await {
            if let Err(e) = self.vector.delete_by_doc(doc_id).await {
                warn!(doc_id, error = %e, "Vector delete failed, continuing with relational delete");
            }
        } else {
            warn!(doc_id, "Vector delete skipped, adapter disconnected");
        }

        self.repo.delete_document_row(&txn, doc_id).await?;
        self.repo.adjust_doc_count(&txn, document.kb_id, -1).await?;

        txn.commit().await?;
        info!(doc_id, kb_id = document.kb_id, "Document deleted");
        Ok(())
    }

    /// Delete a knowledge base, cascading to its documents and vectors
    pub async fn delete_knowledge_base(&self, kb_id: i64) -> Result<()> {
        self.repo
            .find_knowledge_base(kb_id)
            .await?
            .ok_or_else(|| AppError::not_found("knowledge base", kb_id))?;

        let txn = self.repo.begin().await?;

        if self.vector.is_connected().await {
            if let Err(e) = self.vector.delete_by_kb(kb_id).await {
                warn!(kb_id, error = %e, "Vector delete failed, continuing with relational delete");
            }
        } else {
            warn!(kb_id, "Vector delete skipped, adapter disconnected");
        }

        let removed = self.repo.delete_documents_by_kb(&txn, kb_id).await?;
        self.repo.delete_knowledge_base_row(&txn, kb_id).await?;

        txn.commit().await?;
        info!(kb_id, documents_removed = removed, "Knowledge base deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, SharedConfig};
    use crate::db;
    use crate::embeddings::MockEmbedder;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn vector_store_mock() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/collections/has"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "code": 0, "data": { "has": true } })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/insert"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "data": {} })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/delete"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "data": {} })),
            )
            .mount(&server)
            .await;
        server
    }

    async fn test_service(server: &MockServer) -> (DocumentService, Repository) {
        let mut app_config = AppConfig::default();
        app_config.milvus_address = server.uri();
        app_config.vector_dim = 4;
        app_config.chunk_size = 50;
        app_config.chunk_overlap = 5;

        let conn = db::connect_in_memory().await.unwrap();
        db::bootstrap(&conn).await.unwrap();
        let repo = Repository::new(conn);

        let embedder = Arc::new(MockEmbedder::new(4));
        let vector = Arc::new(crate::vector::VectorIndex::connect(&app_config, embedder).await);
        let config = SharedConfig::new(app_config);

        let service = DocumentService::new(repo.clone(), DocumentParser::new(), vector, config);
        (service, repo)
    }

    #[tokio::test]
    async fn upload_indexes_and_counts() {
        let server = vector_store_mock().await;
        let (service, repo) = test_service(&server).await;

        let kb = repo
            .create_knowledge_base("kb1".into(), "".into(), 1)
            .await
            .unwrap();

        let body = b"# Hi\n\npara 1\n\npara 2".to_vec();
        let (document, chunk_count) = service
            .upload_document("hello.md", body, kb.id, 1)
            .await
            .unwrap();

        assert_eq!(chunk_count, 1);
        assert_eq!(document.kb_id, kb.id);

        let kb = repo.find_knowledge_base(kb.id).await.unwrap().unwrap();
        assert_eq!(kb.doc_count, 1);
    }

    #[tokio::test]
    async fn duplicate_bytes_are_rejected_and_count_unchanged() {
        let server = vector_store_mock().await;
        let (service, repo) = test_service(&server).await;

        let kb = repo
            .create_knowledge_base("kb1".into(), "".into(), 1)
            .await
            .unwrap();

        let body = b"# Hi\n\npara 1\n\npara 2".to_vec();
        service
            .upload_document("hello.md", body.clone(), kb.id, 1)
            .await
            .unwrap();

        // Same bytes under a different name are still a duplicate
        let err = service
            .upload_document("renamed.md", body, kb.id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Duplicate(_)));
        assert_eq!(
            err.to_string(),
            "document already exists in this knowledge base"
        );

        let kb = repo.find_knowledge_base(kb.id).await.unwrap().unwrap();
        assert_eq!(kb.doc_count, 1);
    }

    #[tokio::test]
    async fn unknown_kb_is_rejected_before_any_side_effect() {
        let server = vector_store_mock().await;
        let (service, repo) = test_service(&server).await;

        let err = service
            .upload_document("hello.md", b"text".to_vec(), 999, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
        assert_eq!(repo.count_documents().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disallowed_suffix_is_rejected() {
        let server = vector_store_mock().await;
        let (service, repo) = test_service(&server).await;

        let kb = repo
            .create_knowledge_base("kb1".into(), "".into(), 1)
            .await
            .unwrap();

        let err = service
            .upload_document("evil.exe", b"MZ".to_vec(), kb.id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFileType(_)));
    }

    #[tokio::test]
    async fn delete_document_decrements_count() {
        let server = vector_store_mock().await;
        let (service, repo) = test_service(&server).await;

        let kb = repo
            .create_knowledge_base("kb1".into(), "".into(), 1)
            .await
            .unwrap();
        let (document, _) = service
            .upload_document("hello.md", b"some text here".to_vec(), kb.id, 1)
            .await
            .unwrap();

        service.delete_document(document.id).await.unwrap();

        let kb = repo.find_knowledge_base(kb.id).await.unwrap().unwrap();
        assert_eq!(kb.doc_count, 0);
        assert!(repo.find_document(document.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_document_is_not_found() {
        let server = vector_store_mock().await;
        let (service, _repo) = test_service(&server).await;

        let err = service.delete_document(12345).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn kb_cascade_removes_documents() {
        let server = vector_store_mock().await;
        let (service, repo) = test_service(&server).await;

        let kb = repo
            .create_knowledge_base("kb1".into(), "".into(), 1)
            .await
            .unwrap();
        service
            .upload_document("a.md", b"first document".to_vec(), kb.id, 1)
            .await
            .unwrap();
        service
            .upload_document("b.md", b"second document".to_vec(), kb.id, 1)
            .await
            .unwrap();

        service.delete_knowledge_base(kb.id).await.unwrap();

        assert!(repo.find_knowledge_base(kb.id).await.unwrap().is_none());
        assert_eq!(repo.count_documents_by_kb(kb.id).await.unwrap(), 0);
    }
}
