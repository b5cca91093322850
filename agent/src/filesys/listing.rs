//! Local file system operations requested remotely over the file-operation topics.

use std::time::UNIX_EPOCH;

use patch_protocol::FileEntry;
use tokio::fs;

use crate::errors::AgentError;

/// List the contents of a directory.
///
/// Entries are sorted: directories first, then files, both alphabetically.
pub async fn list_directory(path: &str) -> Result<Vec<FileEntry>, AgentError> {
    let mut read_dir = fs::read_dir(path).await?;
    let mut entries = Vec::new();

    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let full_path = entry.path().to_string_lossy().into_owned();
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        entries.push(FileEntry {
            name,
            path: full_path,
            is_dir: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
        });
    }

    entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });

    Ok(entries)
}

/// Delete a file or directory (recursive for directories).
pub async fn delete_path(path: &str) -> Result<(), AgentError> {
    let metadata = fs::metadata(path).await?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(())
}
