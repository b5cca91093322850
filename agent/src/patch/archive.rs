//! Patch archive extraction

use std::path::Path;

use tracing::{debug, warn};

use crate::errors::AgentError;

/// Unpack the zip at `archive` into `dest`, returning the number of files written.
///
/// Entries whose names would land outside `dest` are skipped.
pub async fn extract_zip(archive: &Path, dest: &Path) -> Result<usize, AgentError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip_blocking(&archive, &dest)).await?
}

fn extract_zip_blocking(archive: &Path, dest: &Path) -> Result<usize, AgentError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let mut written = 0;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!("Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let outpath = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = std::fs::File::create(&outpath)?;
        std::io::copy(&mut entry, &mut outfile)?;
        written += 1;
    }

    debug!("Extracted {} files from {}", written, archive.display());
    Ok(written)
}
