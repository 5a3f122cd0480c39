//! Worker-app asset extraction.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, ToolsError};

/// Writes the worker app's files into a directory.
#[async_trait]
pub trait Unpacker: Send + Sync {
    async fn unpack(&self, dest_dir: &Path) -> Result<()>;
}

/// Copies the worker-app tree from a local assets directory.
///
/// Every extracted file is made owner-only executable (`0700`) on Unix so the
/// pushed app can run its scripts.
#[derive(Debug, Clone)]
pub struct AssetUnpacker {
    source: PathBuf,
}

impl AssetUnpacker {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl Unpacker for AssetUnpacker {
    async fn unpack(&self, dest_dir: &Path) -> Result<()> {
        let source = self.source.clone();
        let dest = dest_dir.to_path_buf();

        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| ToolsError::Assets {
                message: e.to_string(),
            })?
            .map_err(|e| ToolsError::Assets {
                message: format!("{}: {}", self.source.display(), e),
            })?;

        debug!("Extracted {} asset files to {}", copied, dest_dir.display());
        Ok(())
    }
}

fn copy_tree(source: &Path, dest: &Path) -> io::Result<usize> {
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "assets directory does not exist",
        ));
    }
    create_private_dir(dest)?;

    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            set_private(&target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_private(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_private(_path: &Path) -> io::Result<()> {
    Ok(())
}
