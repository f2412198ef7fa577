//! SeaORM entity models
//!
//! One entity per relational table. Chunks have no table here: they live
//! only in the vector index.

mod chat_history;
mod document;
mod knowledge_base;
mod role;
mod system_config;
mod user;

pub use user::{
    ActiveModel as UserActiveModel, Column as UserColumn, Entity as UserEntity, Model as User,
};

pub use role::{
    ActiveModel as RoleActiveModel, Column as RoleColumn, Entity as RoleEntity, Model as Role,
};

pub use knowledge_base::{
    ActiveModel as KnowledgeBaseActiveModel, Column as KnowledgeBaseColumn,
    Entity as KnowledgeBaseEntity, Model as KnowledgeBase,
};

pub use document::{
    ActiveModel as DocumentActiveModel, Column as DocumentColumn, Entity as DocumentEntity,
    Model as Document,
};

pub use chat_history::{
    ActiveModel as ChatHistoryActiveModel, Column as ChatHistoryColumn,
    Entity as ChatHistoryEntity, Model as ChatHistory,
};

pub use system_config::{
    ActiveModel as SystemConfigActiveModel, Column as SystemConfigColumn,
    Entity as SystemConfigEntity, Model as SystemConfig,
};
