//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the agent
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Agent settings file
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Coordinator settings file
    pub fn coordinator_settings_file(&self) -> File {
        File::new(self.base_dir.join("coordinator.json"))
    }

    /// Coordinator record store
    pub fn records_file(&self) -> File {
        File::new(self.base_dir.join("records.json"))
    }

    /// Downloaded artifacts, one file per patch
    pub fn downloads_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("downloads"))
    }

    /// Local file the artifact for `patch_id` is downloaded into
    pub fn download_file(&self, patch_id: &str) -> File {
        self.downloads_dir().file(&format!("{}.zip", sanitize_file_name(patch_id)))
    }

    /// Scratch directory the artifact is extracted into
    pub fn update_root(&self) -> Dir {
        Dir::new(self.base_dir.join("update"))
    }

    /// Parent of the timestamped backup directories
    pub fn backups_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("backups"))
    }

    /// Generated restart scripts
    pub fn scripts_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("scripts"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::AgentError> {
        self.downloads_dir().create().await?;
        self.update_root().create().await?;
        self.backups_dir().create().await?;
        self.scripts_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

/// Replace characters that are not safe in a file name.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

impl Default for StorageLayout {
    fn default() -> Self {
        // Use /etc/branchpatch on Linux, or user home directory on other platforms
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/etc/branchpatch");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".branchpatch");

        Self::new(base_dir)
    }
}

// Add dirs crate functionality inline for cross-platform support
#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
