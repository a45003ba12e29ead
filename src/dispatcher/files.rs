//! Deduplicated file uploads

use super::Dispatcher;
use crate::cache::{FileEntry, FileType};
use crate::config::default_request_cache;
use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::fingerprint::{self, Fingerprint};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A file handed to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpload {
    /// Caller-chosen id. Defaults to the content fingerprint.
    #[serde(default)]
    pub file_id: Option<String>,
    pub bytes: Vec<u8>,
    /// Original file name, used to guess the file type
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub file_type: Option<FileType>,
    #[serde(default = "default_request_cache")]
    pub cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResponse {
    pub file_id: String,
    pub content_id: String,
    pub file_type: FileType,
    /// The file id was new
    pub created: bool,
    /// The bytes were already stored under some file id
    pub deduplicated: bool,
    pub request_count: i64,
}

impl FileUpload {
    fn resolve_type(&self) -> FileType {
        match (self.file_type, &self.name) {
            (Some(file_type), _) => file_type,
            (None, Some(name)) => FileType::detect(name),
            (None, None) => FileType::Document,
        }
    }
}

fn check_mapping(entry: &FileEntry, content_id: &Fingerprint) -> Result<()> {
    if entry.content_id != content_id.as_str() {
        return Err(Error::Conflict(format!(
            "file {} already maps to content {}",
            entry.file_id, entry.content_id
        )));
    }
    Ok(())
}

impl Dispatcher {
    /// Store an uploaded file, deduplicating identical bytes.
    ///
    /// Re-uploading the same bytes under the same id counts a request.
    /// Reusing an id for different bytes is a [`Error::Conflict`].
    pub async fn submit_file(&self, upload: FileUpload) -> Result<FileResponse> {
        let file_type = upload.resolve_type();
        let content_id = fingerprint::file_fingerprint(&upload.bytes);
        let file_id = upload
            .file_id
            .clone()
            .unwrap_or_else(|| content_id.to_string());

        if let Some(existing) = self.files.get(&file_id).await? {
            check_mapping(&existing, &content_id)?;
        }

        let deduplicated = self.file_contents.exists(&content_id).await?;
        let stored = self.file_contents.put(&upload.bytes).await?;

        let (entry, created) = self
            .files
            .record(&file_id, &stored, file_type, upload.cache)
            .await?;
        check_mapping(&entry, &stored)?;

        if created {
            info!(file_id = %entry.file_id, content_id = %stored, deduplicated, "Stored file");
        } else {
            debug!(file_id = %entry.file_id, request_count = entry.request_count, "File already known");
        }

        Ok(FileResponse {
            file_id: entry.file_id.clone(),
            content_id: entry.content_id.clone(),
            file_type: entry.get_file_type()?,
            created,
            deduplicated,
            request_count: entry.request_count,
        })
    }

    /// Fetch a file and its bytes, counting the access
    pub async fn get_file(&self, file_id: &str) -> Result<(FileEntry, Vec<u8>)> {
        let entry = self
            .files
            .lookup(file_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))?;
        let content_id: Fingerprint = entry.content_id.parse()?;
        let bytes = self.file_contents.get(&content_id).await?;
        Ok((entry, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    fn upload(file_id: Option<&str>, bytes: &[u8]) -> FileUpload {
        FileUpload {
            file_id: file_id.map(str::to_string),
            bytes: bytes.to_vec(),
            name: None,
            file_type: None,
            cache: true,
        }
    }

    #[tokio::test]
    async fn test_file_id_defaults_to_content() {
        let h = harness().await;
        let stored = h.dispatcher.submit_file(upload(None, b"%PDF-1.7")).await.unwrap();
        assert_eq!(stored.file_id, stored.content_id);
        assert!(stored.created);
        assert!(!stored.deduplicated);
        assert_eq!(stored.file_type, FileType::Document);

        let again = h.dispatcher.submit_file(upload(None, b"%PDF-1.7")).await.unwrap();
        assert!(!again.created);
        assert!(again.deduplicated);
        assert_eq!(again.request_count, 2);
    }

    #[tokio::test]
    async fn test_same_bytes_under_two_ids() {
        let h = harness().await;
        let a = h.dispatcher.submit_file(upload(Some("a"), b"shared")).await.unwrap();
        let b = h.dispatcher.submit_file(upload(Some("b"), b"shared")).await.unwrap();

        assert_eq!(a.content_id, b.content_id);
        assert!(b.created);
        assert!(b.deduplicated);
    }

    #[tokio::test]
    async fn test_reused_id_with_other_bytes_conflicts() {
        let h = harness().await;
        h.dispatcher.submit_file(upload(Some("a"), b"first")).await.unwrap();

        let result = h.dispatcher.submit_file(upload(Some("a"), b"second")).await;
        assert!(matches!(result, Err(Error::Conflict(_))));

        let (entry, bytes) = h.dispatcher.get_file("a").await.unwrap();
        assert_eq!(bytes, b"first");
        assert_eq!(entry.request_count, 2);
    }

    #[tokio::test]
    async fn test_type_from_name() {
        let h = harness().await;
        let mut clip = upload(Some("clip"), b"\x00\x00\x00\x18ftypmp42");
        clip.name = Some("holiday.mp4".to_string());
        let stored = h.dispatcher.submit_file(clip).await.unwrap();
        assert_eq!(stored.file_type, FileType::Video);
    }

    #[tokio::test]
    async fn test_file_errors() {
        let h = harness().await;
        assert!(matches!(
            h.dispatcher.get_file("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            h.dispatcher.submit_file(upload(None, b"")).await,
            Err(Error::Validation(_))
        ));
    }
}
