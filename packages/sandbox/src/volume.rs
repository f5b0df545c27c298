// ABOUTME: Persistent volume shared by every sandbox and the staging area for projects
// ABOUTME: Host directory with link-safe file reads and writes and whole-project replacement

use crate::archive::{create_tar_archive, unpack_validated, validate_archive, validate_tar, ArchiveError};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Directory under the volume root that holds the staged project
pub const PROJECT_DIR: &str = "project";

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("Refusing to follow a link inside the volume: {0}")]
    LinkRefused(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, VolumeError>;

/// Host directory mounted read-write into every sandbox.
///
/// Sandboxes can create anything inside it, links included, so file access never follows
/// a link. Writes are not coordinated between sandboxes or requests; the last writer wins.
#[derive(Debug, Clone)]
pub struct PersistentVolume {
    root: PathBuf,
}

impl PersistentVolume {
    /// Open (creating if needed) the volume at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self) -> PathBuf {
        self.root.join(PROJECT_DIR)
    }

    /// The staged project when it is a real directory; `None` when nothing is staged
    pub async fn staged_project(&self) -> Result<Option<PathBuf>> {
        let path = self.project_dir();
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                Err(VolumeError::LinkRefused(PROJECT_DIR.to_string()))
            }
            Ok(meta) if meta.is_dir() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_file(&self, name: &str, content: &str) -> Result<()> {
        let path = self.resolve(name).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let mut file = no_follow(&mut options)
            .open(&path)
            .await
            .map_err(|e| refuse_links(name, e))?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        debug!(file = %name, bytes = content.len(), "Wrote volume file");
        Ok(())
    }

    /// `None` when the file does not exist
    pub async fn read_file(&self, name: &str) -> Result<Option<String>> {
        let path = self.resolve(name).await?;

        let mut options = tokio::fs::OpenOptions::new();
        options.read(true);
        let mut file = match no_follow(&mut options).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(refuse_links(name, e)),
        };

        let mut content = String::new();
        file.read_to_string(&mut content).await?;
        Ok(Some(content))
    }

    /// Replace the staged project with the contents of a zip file or gzip tarball
    pub async fn replace_project_from_archive(&self, bytes: Vec<u8>) -> Result<usize> {
        let summary = validate_archive(&bytes)?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            replace_dir(&root, |staging| {
                unpack_validated(&bytes, summary.format, staging)
            })
        })
        .await
        .map_err(io::Error::other)??;

        info!(
            entries = summary.entries,
            format = ?summary.format,
            "Replaced staged project from archive"
        );
        Ok(summary.entries)
    }

    /// Replace the staged project with a copy of `source`.
    ///
    /// Links inside `source` are copied as links, and only when they resolve inside it.
    pub async fn replace_project_from_dir(&self, source: &Path) -> Result<()> {
        if !source.is_dir() {
            return Err(VolumeError::SourceNotFound(source.display().to_string()));
        }
        let root = self.root.clone();
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let tar = create_tar_archive(&source)?;
            validate_tar(&tar)?;
            replace_dir(&root, |staging| Archive::new(tar.as_slice()).unpack(staging))?;
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;

        info!("Replaced staged project from directory");
        Ok(())
    }

    /// Relative, non-empty names that stay inside the volume without crossing a link
    async fn resolve(&self, name: &str) -> Result<PathBuf> {
        let path = Path::new(name);
        let valid = !name.trim().is_empty()
            && path.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(VolumeError::InvalidName(name.to_string()));
        }

        // The root is canonical, so only components below it can be links
        let mut current = self.root.clone();
        for component in path.components() {
            current.push(component);
            match tokio::fs::symlink_metadata(&current).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    warn!(file = %name, "Refusing volume path through a link");
                    return Err(VolumeError::LinkRefused(name.to_string()));
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self.root.join(path))
    }
}

/// Open without following a link in the final component
fn no_follow(options: &mut tokio::fs::OpenOptions) -> &mut tokio::fs::OpenOptions {
    #[cfg(unix)]
    {
        options.custom_flags(libc::O_NOFOLLOW);
    }
    options
}

fn refuse_links(name: &str, err: io::Error) -> VolumeError {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::ELOOP) {
            warn!(file = %name, "Refusing to open a link in the volume");
            return VolumeError::LinkRefused(name.to_string());
        }
    }
    VolumeError::Io(err)
}

/// Fill a fresh staging directory, then swap it in for `root/project`
fn replace_dir<F>(root: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let staging = root.join(format!(".staging-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&staging)?;

    if let Err(e) = fill(&staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    // A link planted at `project` is removed itself, never followed
    let target = root.join(PROJECT_DIR);
    match std::fs::symlink_metadata(&target) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&target)?,
        Ok(_) => std::fs::remove_file(&target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::rename(&staging, &target)
}
