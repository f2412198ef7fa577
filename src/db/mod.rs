//! Database layer
//!
//! Provides:
//! - SQLite connection setup (single writer, WAL)
//! - Schema bootstrap and seed data (roles, initial admin, default config)
//! - The repository facade for all data access

pub mod models;
mod repository;

pub use repository::Repository;

use crate::auth;
use crate::errors::{AppError, Result};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, Set,
};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS roles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    level INTEGER NOT NULL DEFAULT 999,
    permissions TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    role_id INTEGER NOT NULL REFERENCES roles(id),
    status TEXT NOT NULL DEFAULT 'active',
    last_login_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS knowledge_bases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    doc_count INTEGER NOT NULL DEFAULT 0,
    creator_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kb_id INTEGER NOT NULL REFERENCES knowledge_bases(id),
    file_name TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    creator_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(content_hash, kb_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_kb ON documents(kb_id);

CREATE TABLE IF NOT EXISTS chat_histories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    conversation_id TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_histories_user ON chat_histories(user_id);

CREATE TABLE IF NOT EXISTS system_configs (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL DEFAULT ''
);
"#;

/// Open the SQLite database, creating the parent directory when needed
pub async fn connect(db_path: &str) -> Result<DatabaseConnection> {
    if let Some(dir) = Path::new(db_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .map_err(|e| AppError::Internal(format!("failed to create database directory: {e}")))?;
        }
    }

    let url = format!("sqlite://{db_path}?mode=rwc");
    let mut options = ConnectOptions::new(url);
    // SQLite supports a single writer
    options
        .max_connections(1)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(options).await?;
    db.execute_unprepared("PRAGMA journal_mode = WAL").await?;
    db.execute_unprepared("PRAGMA busy_timeout = 5000").await?;

    Ok(db)
}

/// Open an in-memory database, used by tests. Pinned to one connection:
/// every pooled connection would otherwise get its own empty database.
pub async fn connect_in_memory() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1);
    let db = Database::connect(options).await?;
    Ok(db)
}

/// Create tables and seed roles, the initial admin account, and default
/// system configuration rows
pub async fn bootstrap(db: &DatabaseConnection) -> Result<()> {
    for statement in SCHEMA_DDL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        db.execute_unprepared(statement).await?;
    }

    seed_roles(db).await?;
    seed_initial_admin(db).await?;
    seed_default_configs(db).await?;

    Ok(())
}

async fn seed_roles(db: &DatabaseConnection) -> Result<()> {
    let defaults = [
        ("admin", 0, r#"["all"]"#),
        ("user", 10, r#"["chat", "view_kb", "upload_doc"]"#),
        ("guest", 100, r#"["chat", "view_kb"]"#),
    ];

    for (name, level, permissions) in defaults {
        let existing = models::RoleEntity::find()
            .filter(models::RoleColumn::Name.eq(name))
            .one(db)
            .await?;
        if existing.is_none() {
            let now = Utc::now();
            models::RoleActiveModel {
                name: Set(name.to_string()),
                level: Set(level),
                permissions: Set(permissions.to_string()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(db)
            .await?;
        }
    }

    Ok(())
}

async fn seed_initial_admin(db: &DatabaseConnection) -> Result<()> {
    let admin_role = models::RoleEntity::find()
        .filter(models::RoleColumn::Name.eq("admin"))
        .one(db)
        .await?
        .ok_or_else(|| AppError::Internal("admin role missing after seeding".to_string()))?;

    let admin_count = models::UserEntity::find()
        .filter(models::UserColumn::RoleId.eq(admin_role.id))
        .count(db)
        .await?;
    if admin_count > 0 {
        return Ok(());
    }

    let now = Utc::now();
    let admin = models::UserActiveModel {
        name: Set("Administrator".to_string()),
        email: Set("admin@ragforge.local".to_string()),
        password: Set(auth::hash_password("admin123456")?),
        role_id: Set(admin_role.id),
        status: Set("active".to_string()),
        last_login_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    info!(email = %admin.email, "Created initial admin account");
    Ok(())
}

async fn seed_default_configs(db: &DatabaseConnection) -> Result<()> {
    let defaults = [
        ("system_name", "ragforge"),
        ("system_desc", "Retrieval-augmented generation service"),
        ("max_kb_per_user", "10"),
        ("max_doc_per_kb", "100"),
        ("chat_history_days", "30"),
    ];

    for (key, value) in defaults {
        let existing = models::SystemConfigEntity::find_by_id(key.to_string())
            .one(db)
            .await?;
        if existing.is_none() {
            models::SystemConfigActiveModel {
                key: Set(key.to_string()),
                value: Set(value.to_string()),
            }
            .insert(db)
            .await?;
        }
    }

    Ok(())
}
