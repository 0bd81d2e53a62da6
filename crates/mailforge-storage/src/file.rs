//! On-disk attachment storage
//!
//! Attachment files are exclusively owned by the `attachment_files` row
//! that references them; deleting the row must delete the file. Filenames
//! embed a timestamp plus randomness so concurrent writers never collide.

use chrono::Utc;
use mailforge_common::{Error, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Root for API-submitted attachments, relative to the store base.
pub const UPLOAD_ROOT: &str = "data/uploads";

/// Root for inbound MIME parts, relative to the store base.
pub const INBOX_ATTACHMENT_ROOT: &str = "data/inbox_attachments";

/// Attachment file store rooted at the process working directory (or a
/// test directory).
#[derive(Clone)]
pub struct AttachmentStore {
    base: PathBuf,
}

impl AttachmentStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Stage an API-submitted attachment under `data/uploads`.
    /// Returns the store-relative path.
    pub async fn save_upload(&self, original_name: &str, data: &[u8]) -> Result<String> {
        self.save(UPLOAD_ROOT, original_name, data).await
    }

    /// Persist a decoded inbound MIME part under `data/inbox_attachments`.
    pub async fn save_inbox_part(
        &self,
        inbox_id: i64,
        original_name: &str,
        data: &[u8],
    ) -> Result<String> {
        let ext = extension_of(original_name);
        let name = format!("{}_{}{}", inbox_id, Utc::now().timestamp_nanos_opt().unwrap_or(0), ext);
        self.write(INBOX_ATTACHMENT_ROOT, &name, data).await
    }

    async fn save(&self, root: &str, original_name: &str, data: &[u8]) -> Result<String> {
        let ext = extension_of(original_name);
        let nonce: u32 = {
            let mut rng = rand::thread_rng();
            rng.gen()
        };
        let name = format!(
            "{}_{:08x}{}",
            Utc::now().timestamp_nanos_opt().unwrap_or(0),
            nonce,
            ext
        );
        self.write(root, &name, data).await
    }

    async fn write(&self, root: &str, name: &str, data: &[u8]) -> Result<String> {
        let relative = format!("{}/{}", root, name);
        let full = self.base.join(&relative);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }
        fs::write(&full, data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", relative, e)))?;

        debug!(path = %relative, size = data.len(), "Stored attachment");
        Ok(relative)
    }

    /// Read a staged file by its store-relative path.
    pub async fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let full = self.resolve(relative)?;
        fs::read(&full)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", relative, e)))
    }

    /// Delete a staged file. Missing files are not an error: the row is
    /// the source of truth and may outlive a manually removed file.
    pub async fn remove(&self, relative: &str) -> Result<u64> {
        let full = self.resolve(relative)?;
        let size = match fs::metadata(&full).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(0),
        };
        fs::remove_file(&full)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete {}: {}", relative, e)))?;
        Ok(size)
    }

    /// Recursively remove empty directories under both attachment roots.
    pub async fn prune_empty_dirs(&self) {
        for root in [UPLOAD_ROOT, INBOX_ATTACHMENT_ROOT] {
            prune_dir(&self.base.join(root)).await;
        }
    }

    /// Store-relative paths only; rejects traversal and absolute paths.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        if relative.contains("..") || relative.starts_with('/') || relative.starts_with('\\') {
            return Err(Error::Storage(format!("Invalid attachment path: {}", relative)));
        }
        Ok(self.base.join(relative))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

fn extension_of(name: &str) -> String {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!(".{}", ext),
        _ => ".dat".to_string(),
    }
}

/// Depth-first removal of empty subdirectories. The root itself is kept.
async fn prune_dir(dir: &Path) {
    let mut stack = vec![dir.to_path_buf()];
    let mut seen = Vec::new();

    while let Some(current) = stack.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        seen.push(current.clone());
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(entry.path());
            }
        }
    }

    // Children were pushed after their parents, so removing in reverse
    // order empties nested directories first.
    for path in seen.into_iter().rev() {
        if path == dir {
            continue;
        }
        let empty = match fs::read_dir(&path).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
            Err(_) => false,
        };
        if empty {
            let _ = fs::remove_dir(&path).await;
        }
    }
}
