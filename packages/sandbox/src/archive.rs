// ABOUTME: Tar, gzip and zip helpers for moving project content into sandboxes and volumes
// ABOUTME: Builds tar streams from host paths and validates uploaded archives before unpacking

use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use zip::ZipArchive;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    #[error("Archive entry escapes the target directory: {0}")]
    UnsafeEntry(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_LOCAL_HEADER: [u8; 4] = *b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: [u8; 4] = *b"PK\x05\x06";

/// Upload formats, told apart by their leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    GzipTar,
    Zip,
}

impl ArchiveFormat {
    pub fn detect(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ArchiveError::Corrupt("archive is empty".to_string()));
        }
        if bytes.starts_with(&GZIP_MAGIC) {
            Ok(Self::GzipTar)
        } else if bytes.starts_with(&ZIP_LOCAL_HEADER) || bytes.starts_with(&ZIP_EMPTY_ARCHIVE) {
            Ok(Self::Zip)
        } else {
            Err(ArchiveError::Corrupt(
                "not a zip file or gzip tarball".to_string(),
            ))
        }
    }

    /// File suffix used for temporary copies
    pub fn extension(&self) -> &'static str {
        match self {
            Self::GzipTar => "tar.gz",
            Self::Zip => "zip",
        }
    }
}

/// What a validated archive holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub format: ArchiveFormat,
    pub entries: usize,
}

/// Tar the contents of `path` (a directory's children, or a single file).
///
/// Symlinks are stored as links rather than followed, so nothing outside `path` is read.
pub fn create_tar_archive(path: &Path) -> io::Result<Vec<u8>> {
    let mut archive = Builder::new(Vec::new());
    archive.follow_symlinks(false);

    if path.is_file() {
        let mut file = fs::File::open(path)?;
        let file_name = path.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Invalid file name")
        })?;
        archive.append_file(file_name, &mut file)?;
    } else {
        archive.append_dir_all(".", path)?;
    }

    archive.into_inner()
}

/// Tar holding one regular file named `name`
pub fn single_file_tar(name: &str, contents: &[u8]) -> io::Result<Vec<u8>> {
    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );
    header.set_cksum();

    let mut archive = Builder::new(Vec::new());
    archive.append_data(&mut header, name, contents)?;
    archive.into_inner()
}

/// Read every entry of an uploaded zip or gzip tarball without writing anything
pub fn validate_archive(bytes: &[u8]) -> Result<ArchiveSummary> {
    let format = ArchiveFormat::detect(bytes)?;
    let entries = match format {
        ArchiveFormat::GzipTar => validate_gzip_tar(bytes)?,
        ArchiveFormat::Zip => validate_zip(bytes)?,
    };
    Ok(ArchiveSummary { format, entries })
}

/// Validate a gzip tarball and return its entry count.
///
/// Truncated or non-gzip input is `Corrupt`. Entries with absolute paths or `..`
/// components, and links that could resolve outside the archive root, are `UnsafeEntry`.
pub fn validate_gzip_tar(bytes: &[u8]) -> Result<usize> {
    if bytes.is_empty() {
        return Err(ArchiveError::Corrupt("archive is empty".to_string()));
    }

    let mut archive = Archive::new(GzDecoder::new(bytes));
    let count = check_tar_entries(&mut archive)?;

    // Drain to the gzip trailer so a truncated stream fails its length/CRC check
    let mut decoder = archive.into_inner();
    io::copy(&mut decoder, &mut io::sink()).map_err(corrupt)?;

    Ok(count)
}

/// Validate an uncompressed tar, such as one built from a host directory
pub fn validate_tar(bytes: &[u8]) -> Result<usize> {
    check_tar_entries(&mut Archive::new(bytes))
}

fn check_tar_entries<R: Read>(archive: &mut Archive<R>) -> Result<usize> {
    let mut tree = EntryTree::default();
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?.into_owned();
        check_entry_path(&path)?;

        match entry.header().entry_type() {
            EntryType::Symlink | EntryType::Link => {
                let target = match entry.link_name().map_err(corrupt)? {
                    Some(target) => target.into_owned(),
                    None => {
                        return Err(ArchiveError::Corrupt(format!(
                            "link {} has no target",
                            path.display()
                        )))
                    }
                };
                let hard = entry.header().entry_type() == EntryType::Link;
                tree.add_link(path, target, hard);
            }
            _ => tree.add(path),
        }

        io::copy(&mut entry, &mut io::sink()).map_err(corrupt)?;
    }
    tree.check()
}

/// Validate a zip file and return its entry count; every member's CRC is checked
pub fn validate_zip(bytes: &[u8]) -> Result<usize> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_corrupt)?;

    let mut tree = EntryTree::default();
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(zip_corrupt)?;
        let path = file
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafeEntry(file.name().to_string()))?;
        check_entry_path(&path)?;

        let is_symlink = file
            .unix_mode()
            .is_some_and(|mode| mode & 0o170000 == 0o120000);

        let mut contents = Vec::new();
        file.read_to_end(&mut contents).map_err(corrupt)?;

        if is_symlink {
            let target = String::from_utf8(contents).map_err(|_| {
                ArchiveError::Corrupt(format!("link {} has an invalid target", path.display()))
            })?;
            tree.add_link(path, PathBuf::from(target), false);
        } else {
            tree.add(path);
        }
    }
    tree.check()
}

/// Validate and unpack an uploaded archive into `dest` on the local filesystem
pub fn unpack_archive(bytes: &[u8], dest: &Path) -> Result<ArchiveSummary> {
    let summary = validate_archive(bytes)?;
    fs::create_dir_all(dest)?;
    unpack_validated(bytes, summary.format, dest)?;
    Ok(summary)
}

/// Unpack bytes that already passed [`validate_archive`]
pub fn unpack_validated(bytes: &[u8], format: ArchiveFormat, dest: &Path) -> io::Result<()> {
    match format {
        ArchiveFormat::GzipTar => Archive::new(GzDecoder::new(bytes)).unpack(dest),
        ArchiveFormat::Zip => ZipArchive::new(Cursor::new(bytes))
            .and_then(|mut archive| archive.extract(dest))
            .map_err(io::Error::other),
    }
}

/// Relative paths made only of normal components
fn check_entry_path(path: &Path) -> Result<()> {
    let unsafe_component = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if unsafe_component {
        return Err(ArchiveError::UnsafeEntry(path.display().to_string()));
    }
    Ok(())
}

struct Link {
    path: PathBuf,
    target: PathBuf,
    hard: bool,
}

/// Entry paths and links seen in one archive, checked once the whole listing is known
#[derive(Default)]
struct EntryTree {
    count: usize,
    paths: Vec<PathBuf>,
    links: Vec<Link>,
}

impl EntryTree {
    fn add(&mut self, path: PathBuf) {
        self.count += 1;
        self.paths.push(normalize(&path));
    }

    fn add_link(&mut self, path: PathBuf, target: PathBuf, hard: bool) {
        self.add(path.clone());
        self.links.push(Link {
            path: normalize(&path),
            target,
            hard,
        });
    }

    /// Links must be relative, stay under the root when resolved lexically, and never
    /// pass through another link; no entry may sit beneath a link either
    fn check(self) -> Result<usize> {
        let link_paths: HashSet<&Path> = self.links.iter().map(|l| l.path.as_path()).collect();
        let through_link = |path: &Path| path.ancestors().skip(1).any(|a| link_paths.contains(a));

        for path in &self.paths {
            if through_link(path) {
                return Err(ArchiveError::UnsafeEntry(path.display().to_string()));
            }
        }

        for link in &self.links {
            let unsafe_link = || {
                ArchiveError::UnsafeEntry(format!(
                    "{} -> {}",
                    link.path.display(),
                    link.target.display()
                ))
            };

            // Symlinks resolve from their own directory, hard links from the archive root
            let mut resolved = if link.hard {
                PathBuf::new()
            } else {
                link.path.parent().map(Path::to_path_buf).unwrap_or_default()
            };
            for component in link.target.components() {
                if component != Component::CurDir && link_paths.contains(resolved.as_path()) {
                    return Err(unsafe_link());
                }
                match component {
                    Component::Normal(part) => resolved.push(part),
                    Component::CurDir => {}
                    Component::ParentDir => {
                        if !resolved.pop() {
                            return Err(unsafe_link());
                        }
                    }
                    Component::RootDir | Component::Prefix(_) => return Err(unsafe_link()),
                }
            }
            if through_link(&resolved) {
                return Err(unsafe_link());
            }
        }

        Ok(self.count)
    }
}

/// Drop `.` components so `./a/b` and `a/b` compare equal
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn corrupt(err: io::Error) -> ArchiveError {
    ArchiveError::Corrupt(err.to_string())
}

fn zip_corrupt(err: zip::result::ZipError) -> ArchiveError {
    ArchiveError::Corrupt(err.to_string())
}
