//! Mailforge Storage - Database and file storage
//!
//! This crate owns the embedded SQLite database (models, migrations,
//! repositories) and the on-disk attachment store.

pub mod db;
pub mod file;
pub mod models;
pub mod repository;

pub use db::Database;
pub use file::{AttachmentStore, INBOX_ATTACHMENT_ROOT, UPLOAD_ROOT};
pub use models::*;
pub use repository::*;
