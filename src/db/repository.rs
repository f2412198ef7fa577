//! Repository pattern for database operations
//!
//! Provides a single facade for all data access with proper error handling.
//! Operations that must participate in a caller-owned transaction are
//! generic over the connection.

use crate::db::models::*;
use crate::errors::{AppError, Result};
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, Statement, TransactionTrait,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    db: DatabaseConnection,
}

impl Repository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// The underlying connection, for caller-owned transactions
    pub fn conn(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Begin a transaction
    pub async fn begin(&self) -> Result<sea_orm::DatabaseTransaction> {
        Ok(self.db.begin().await?)
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub async fn ping(&self) -> Result<()> {
        self.db.execute_unprepared("SELECT 1").await?;
        Ok(())
    }

    // ========================================================================
    // Users and roles
    // ========================================================================

    pub async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        RoleEntity::find()
            .filter(RoleColumn::Name.eq(name))
            .one(&self.db)
            .await
            .map_err(Into::into)
    }

    pub async fn find_role_by_id(&self, id: i64) -> Result<Option<Role>> {
        RoleEntity::find_by_id(id).one(&self.db).await.map_err(Into::into)
    }

    pub async fn create_user(
        &self,
        name: String,
        email: String,
        password_hash: String,
        role_id: i64,
        status: String,
    ) -> Result<User> {
        let now = Utc::now();
        let user = UserActiveModel {
            name: Set(name),
            email: Set(email),
            password: Set(password_hash),
            role_id: Set(role_id),
            status: Set(status),
            last_login_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        user.insert(&self.db).await.map_err(Into::into)
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        UserEntity::find()
            .filter(UserColumn::Email.eq(email))
            .one(&self.db)
            .await
            .map_err(Into::into)
    }

    pub async fn find_user_by_id(&self, id: i64) -> Result<Option<User>> {
        UserEntity::find_by_id(id).one(&self.db).await.map_err(Into::into)
    }

    /// Record a successful login
    pub async fn record_login(&self, user_id: i64) -> Result<()> {
        let now = Utc::now();
        let mut user: UserActiveModel = UserEntity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::not_found("user", user_id))?
            .into();
        user.last_login_at = Set(Some(now));
        user.updated_at = Set(now);
        user.update(&self.db).await?;
        Ok(())
    }

    /// List users with their roles, newest first
    pub async fn list_users(
        &self,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<(User, Option<Role>)>, u64)> {
        let total = UserEntity::find().count(&self.db).await?;
        let users = UserEntity::find()
            .find_also_related(RoleEntity)
            .order_by_desc(UserColumn::CreatedAt)
            .paginate(&self.db, page_size)
            .fetch_page(page.saturating_sub(1))
            .await?;

        Ok((users, total))
    }

    pub async fn update_user(
        &self,
        user_id: i64,
        name: Option<String>,
        email: Option<String>,
        password_hash: Option<String>,
        role_id: Option<i64>,
        status: Option<String>,
    ) -> Result<User> {
        let mut user: UserActiveModel = UserEntity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::not_found("user", user_id))?
            .into();

        if let Some(name) = name {
            user.name = Set(name);
        }
        if let Some(email) = email {
            user.email = Set(email);
        }
        if let Some(password_hash) = password_hash {
            user.password = Set(password_hash);
        }
        if let Some(role_id) = role_id {
            user.role_id = Set(role_id);
        }
        if let Some(status) = status {
            user.status = Set(status);
        }
        user.updated_at = Set(Utc::now());

        user.update(&self.db).await.map_err(Into::into)
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<bool> {
        let result = UserEntity::delete_by_id(user_id).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    // ========================================================================
    // Knowledge bases
    // ========================================================================

    pub async fn create_knowledge_base(
        &self,
        name: String,
        description: String,
        creator_id: i64,
    ) -> Result<KnowledgeBase> {
        let now = Utc::now();
        let kb = KnowledgeBaseActiveModel {
            name: Set(name),
            description: Set(description),
            doc_count: Set(0),
            creator_id: Set(creator_id),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        kb.insert(&self.db).await.map_err(Into::into)
    }

    pub async fn find_knowledge_base(&self, id: i64) -> Result<Option<KnowledgeBase>> {
        KnowledgeBaseEntity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(Into::into)
    }

    pub async fn list_knowledge_bases(
        &self,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<KnowledgeBase>, u64)> {
        let total = KnowledgeBaseEntity::find().count(&self.db).await?;
        let kbs = KnowledgeBaseEntity::find()
            .order_by_desc(KnowledgeBaseColumn::CreatedAt)
            .paginate(&self.db, page_size)
            .fetch_page(page.saturating_sub(1))
            .await?;

        Ok((kbs, total))
    }

    pub async fn update_knowledge_base(
        &self,
        kb_id: i64,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<KnowledgeBase> {
        let mut kb: KnowledgeBaseActiveModel = KnowledgeBaseEntity::find_by_id(kb_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::not_found("knowledge base", kb_id))?
            .into();

        if let Some(name) = name {
            kb.name = Set(name);
        }
        if let Some(description) = description {
            kb.description = Set(description);
        }
        kb.updated_at = Set(Utc::now());

        kb.update(&self.db).await.map_err(Into::into)
    }

    /// Atomically bump `doc_count` and refresh `updated_at`. Returns the
    /// number of rows affected; zero means the knowledge base vanished.
    pub async fn adjust_doc_count<C: ConnectionTrait>(
        &self,
        conn: &C,
        kb_id: i64,
        delta: i32,
    ) -> Result<u64> {
        let result = conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE knowledge_bases SET doc_count = doc_count + ?, updated_at = ? WHERE id = ?",
                [
                    delta.into(),
                    Utc::now().to_rfc3339().into(),
                    kb_id.into(),
                ],
            ))
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_knowledge_base_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        kb_id: i64,
    ) -> Result<bool> {
        let result = KnowledgeBaseEntity::delete_by_id(kb_id).exec(conn).await?;
        Ok(result.rows_affected > 0)
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Probe for an existing document with the same content in the same
    /// knowledge base
    pub async fn find_document_by_hash(
        &self,
        kb_id: i64,
        content_hash: &str,
    ) -> Result<Option<Document>> {
        DocumentEntity::find()
            .filter(DocumentColumn::ContentHash.eq(content_hash))
            .filter(DocumentColumn::KbId.eq(kb_id))
            .one(&self.db)
            .await
            .map_err(Into::into)
    }

    pub async fn insert_document<C: ConnectionTrait>(
        &self,
        conn: &C,
        kb_id: i64,
        file_name: String,
        file_size: i64,
        content_hash: String,
        creator_id: i64,
    ) -> Result<Document> {
        let now = Utc::now();
        let document = DocumentActiveModel {
            kb_id: Set(kb_id),
            file_name: Set(file_name),
            file_size: Set(file_size),
            content_hash: Set(content_hash),
            creator_id: Set(creator_id),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        document.insert(conn).await.map_err(Into::into)
    }

    pub async fn find_document(&self, id: i64) -> Result<Option<Document>> {
        DocumentEntity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(Into::into)
    }

    pub async fn delete_document_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        doc_id: i64,
    ) -> Result<bool> {
        let result = DocumentEntity::delete_by_id(doc_id).exec(conn).await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn delete_documents_by_kb<C: ConnectionTrait>(
        &self,
        conn: &C,
        kb_id: i64,
    ) -> Result<u64> {
        let result = DocumentEntity::delete_many()
            .filter(DocumentColumn::KbId.eq(kb_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn list_documents_by_kb(
        &self,
        kb_id: i64,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<Document>, u64)> {
        let total = DocumentEntity::find()
            .filter(DocumentColumn::KbId.eq(kb_id))
            .count(&self.db)
            .await?;
        let documents = DocumentEntity::find()
            .filter(DocumentColumn::KbId.eq(kb_id))
            .order_by_desc(DocumentColumn::CreatedAt)
            .paginate(&self.db, page_size)
            .fetch_page(page.saturating_sub(1))
            .await?;

        Ok((documents, total))
    }

    /// List all documents with their knowledge bases, newest first
    pub async fn list_all_documents(
        &self,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<(Document, Option<KnowledgeBase>)>, u64)> {
        let total = DocumentEntity::find().count(&self.db).await?;
        let documents = DocumentEntity::find()
            .find_also_related(KnowledgeBaseEntity)
            .order_by_desc(DocumentColumn::CreatedAt)
            .paginate(&self.db, page_size)
            .fetch_page(page.saturating_sub(1))
            .await?;

        Ok((documents, total))
    }

    pub async fn count_documents_by_kb(&self, kb_id: i64) -> Result<u64> {
        DocumentEntity::find()
            .filter(DocumentColumn::KbId.eq(kb_id))
            .count(&self.db)
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Chat histories
    // ========================================================================

    pub async fn insert_chat_history(
        &self,
        user_id: i64,
        conversation_id: String,
        title: String,
    ) -> Result<ChatHistory> {
        let now = Utc::now();
        let history = ChatHistoryActiveModel {
            user_id: Set(user_id),
            conversation_id: Set(conversation_id),
            title: Set(title),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        history.insert(&self.db).await.map_err(Into::into)
    }

    pub async fn list_chat_histories(
        &self,
        user_id: i64,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<ChatHistory>, u64)> {
        let total = ChatHistoryEntity::find()
            .filter(ChatHistoryColumn::UserId.eq(user_id))
            .count(&self.db)
            .await?;
        let histories = ChatHistoryEntity::find()
            .filter(ChatHistoryColumn::UserId.eq(user_id))
            .order_by_desc(ChatHistoryColumn::CreatedAt)
            .paginate(&self.db, page_size)
            .fetch_page(page.saturating_sub(1))
            .await?;

        Ok((histories, total))
    }

    // ========================================================================
    // System configuration
    // ========================================================================

    pub async fn all_configs(&self) -> Result<Vec<SystemConfig>> {
        SystemConfigEntity::find().all(&self.db).await.map_err(Into::into)
    }

    /// Upsert configuration rows in one transaction, retrying up to three
    /// times with backoff when SQLite reports the database as locked
    pub async fn save_configs(&self, configs: &BTreeMap<String, String>) -> Result<()> {
        let mut last_err = None;

        // Up to three retries beyond the first attempt, backing off 100/200/300ms
        for attempt in 0..4u64 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * attempt)).await;
            }

            match self.save_configs_once(configs).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let locked = e.to_string().contains("database is locked")
                        || e.to_string().contains("database locked");
                    if !locked {
                        return Err(e);
                    }
                    tracing::warn!(attempt = attempt + 1, "Config save hit a locked database, retrying");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| AppError::Internal("config save failed".to_string())))
    }

    async fn save_configs_once(&self, configs: &BTreeMap<String, String>) -> Result<()> {
        let txn = self.db.begin().await?;

        for (key, value) in configs {
            SystemConfigEntity::insert(SystemConfigActiveModel {
                key: Set(key.clone()),
                value: Set(value.clone()),
            })
            .on_conflict(
                OnConflict::column(SystemConfigColumn::Key)
                    .update_column(SystemConfigColumn::Value)
                    .to_owned(),
            )
            .exec(&txn)
            .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub async fn count_users(&self) -> Result<u64> {
        UserEntity::find().count(&self.db).await.map_err(Into::into)
    }

    pub async fn count_knowledge_bases(&self) -> Result<u64> {
        KnowledgeBaseEntity::find().count(&self.db).await.map_err(Into::into)
    }

    pub async fn count_documents(&self) -> Result<u64> {
        DocumentEntity::find().count(&self.db).await.map_err(Into::into)
    }

    pub async fn count_chat_histories(&self) -> Result<u64> {
        ChatHistoryEntity::find().count(&self.db).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn test_repo() -> Repository {
        let conn = db::connect_in_memory().await.unwrap();
        db::bootstrap(&conn).await.unwrap();
        Repository::new(conn)
    }

    #[tokio::test]
    async fn doc_count_tracks_inserts_and_deletes() {
        let repo = test_repo().await;
        let kb = repo
            .create_knowledge_base("kb1".into(), "".into(), 1)
            .await
            .unwrap();
        assert_eq!(kb.doc_count, 0);

        let txn = repo.begin().await.unwrap();
        let doc = repo
            .insert_document(&txn, kb.id, "a.txt".into(), 10, "hash-a".into(), 1)
            .await
            .unwrap();
        let affected = repo.adjust_doc_count(&txn, kb.id, 1).await.unwrap();
        assert_eq!(affected, 1);
        txn.commit().await.unwrap();

        let kb = repo.find_knowledge_base(kb.id).await.unwrap().unwrap();
        assert_eq!(kb.doc_count, 1);
        assert_eq!(repo.count_documents_by_kb(kb.id).await.unwrap(), 1);

        let txn = repo.begin().await.unwrap();
        repo.delete_document_row(&txn, doc.id).await.unwrap();
        repo.adjust_doc_count(&txn, kb.id, -1).await.unwrap();
        txn.commit().await.unwrap();

        let kb = repo.find_knowledge_base(kb.id).await.unwrap().unwrap();
        assert_eq!(kb.doc_count, 0);
    }

    #[tokio::test]
    async fn adjust_doc_count_reports_missing_kb() {
        let repo = test_repo().await;
        let txn = repo.begin().await.unwrap();
        let affected = repo.adjust_doc_count(&txn, 9999, 1).await.unwrap();
        assert_eq!(affected, 0);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_probe_finds_same_hash_same_kb_only() {
        let repo = test_repo().await;
        let kb1 = repo
            .create_knowledge_base("kb1".into(), "".into(), 1)
            .await
            .unwrap();
        let kb2 = repo
            .create_knowledge_base("kb2".into(), "".into(), 1)
            .await
            .unwrap();

        let txn = repo.begin().await.unwrap();
        repo.insert_document(&txn, kb1.id, "a.txt".into(), 10, "hash-a".into(), 1)
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert!(repo
            .find_document_by_hash(kb1.id, "hash-a")
            .await
            .unwrap()
            .is_some());
        // Same bytes in a different knowledge base are not duplicates
        assert!(repo
            .find_document_by_hash(kb2.id, "hash-a")
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .find_document_by_hash(kb1.id, "hash-b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cascade_delete_removes_documents() {
        let repo = test_repo().await;
        let kb = repo
            .create_knowledge_base("kb1".into(), "".into(), 1)
            .await
            .unwrap();

        let txn = repo.begin().await.unwrap();
        for i in 0..3 {
            repo.insert_document(&txn, kb.id, format!("f{i}.txt"), 10, format!("hash-{i}"), 1)
                .await
                .unwrap();
        }
        txn.commit().await.unwrap();

        let txn = repo.begin().await.unwrap();
        repo.delete_documents_by_kb(&txn, kb.id).await.unwrap();
        repo.delete_knowledge_base_row(&txn, kb.id).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(repo.count_documents_by_kb(kb.id).await.unwrap(), 0);
        assert!(repo.find_knowledge_base(kb.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn config_upsert_overwrites_values() {
        let repo = test_repo().await;
        let mut configs = BTreeMap::new();
        configs.insert("chunk_size".to_string(), "800".to_string());
        repo.save_configs(&configs).await.unwrap();

        configs.insert("chunk_size".to_string(), "900".to_string());
        repo.save_configs(&configs).await.unwrap();

        let rows = repo.all_configs().await.unwrap();
        let chunk_size = rows.iter().find(|c| c.key == "chunk_size").unwrap();
        assert_eq!(chunk_size.value, "900");
    }
}
