//! File upload and retrieval commands

use crate::bus::MemoryBus;
use crate::cache::{FileEntry, FileType};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, FileResponse, FileUpload};
use crate::error::{Error, Result};
use crate::meta::{FileDb, JobDb};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

// File operations never publish, so an in-process bus is enough.
fn file_dispatcher(config: &Config, jobs: &JobDb, files: &FileDb) -> Dispatcher {
    Dispatcher::new(config, jobs.clone(), files.clone(), Arc::new(MemoryBus::new()))
}

/// Store a local file, deduplicating its content
pub async fn cmd_put_file(
    config: &Config,
    jobs: &JobDb,
    files: &FileDb,
    path: &Path,
    file_id: Option<String>,
    file_type: Option<FileType>,
    cache: bool,
) -> Result<FileResponse> {
    if !path.is_file() {
        return Err(Error::Validation(format!(
            "Not a file: {}",
            path.display()
        )));
    }
    info!("Storing {:?}", path);

    let bytes = tokio::fs::read(path).await?;
    let upload = FileUpload {
        file_id,
        bytes,
        name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        file_type,
        cache,
    };
    file_dispatcher(config, jobs, files).submit_file(upload).await
}

/// Fetch a stored file, writing its bytes to `output` if given
pub async fn cmd_get_file(
    config: &Config,
    jobs: &JobDb,
    files: &FileDb,
    file_id: &str,
    output: Option<&Path>,
) -> Result<(FileEntry, usize)> {
    let (entry, bytes) = file_dispatcher(config, jobs, files).get_file(file_id).await?;
    if let Some(path) = output {
        tokio::fs::write(path, &bytes).await?;
        info!("Wrote {} bytes to {:?}", bytes.len(), path);
    }
    Ok((entry, bytes.len()))
}

/// Print the result of storing a file
pub fn print_file_response(response: &FileResponse) {
    let verb = match (response.created, response.deduplicated) {
        (true, false) => "Stored",
        (true, true) => "Linked to existing content",
        (false, _) => "Already stored",
    };
    println!("✓ {} as {}", verb, response.file_id);
    println!("  Content: {}", response.content_id);
    println!("  Type: {}", response.file_type);
    println!("  Requests: {}", response.request_count);
}

/// Print a file entry
pub fn print_file_entry(entry: &FileEntry, size: usize) {
    println!("📦 {}", entry.file_id);
    println!("  Content: {} ({} bytes)", entry.content_id, size);
    println!("  Type: {}", entry.file_type);
    println!("  Cached: {}", if entry.cache { "yes" } else { "no" });
    println!("  Requests: {}", entry.request_count);
    println!("  Created: {}", entry.created_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::testing::setup_dbs;

    #[tokio::test]
    async fn test_put_then_get_file() {
        let (jobs, files, config, tmp) = setup_dbs().await;
        let input = tmp.path().join("notes.txt");
        std::fs::write(&input, "meeting notes").unwrap();

        let stored = cmd_put_file(&config, &jobs, &files, &input, Some("notes".into()), None, true)
            .await
            .unwrap();
        assert_eq!(stored.file_type, FileType::Document);
        assert!(stored.created);

        let output = tmp.path().join("copy.txt");
        let (entry, size) = cmd_get_file(&config, &jobs, &files, "notes", Some(&output))
            .await
            .unwrap();
        assert_eq!(entry.content_id, stored.content_id);
        assert_eq!(size, 13);
        assert_eq!(std::fs::read_to_string(output).unwrap(), "meeting notes");
    }

    #[tokio::test]
    async fn test_put_missing_file() {
        let (jobs, files, config, tmp) = setup_dbs().await;
        let result = cmd_put_file(
            &config,
            &jobs,
            &files,
            &tmp.path().join("absent.bin"),
            None,
            None,
            false,
        )
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
