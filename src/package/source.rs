//! Archive and directory package access.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use super::descriptor::{PackageDescriptor, DESCRIPTOR_PATH};
use crate::{LuaCordError, Result};

/// Path of the default config inside a package.
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Upper bound on the buffer reserved from an archive entry header.
const MAX_PREALLOCATION: u64 = 1024 * 1024;

/// Backing storage of one package.
///
/// Archives are production packages; directories are developer packages
/// and are the only shape that can be unloaded or reloaded.
pub enum PackageSource {
    Archive {
        path: PathBuf,
        archive: Mutex<ZipArchive<File>>,
    },
    Directory {
        path: PathBuf,
    },
}

impl std::fmt::Debug for PackageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageSource::Archive { path, .. } => f.debug_tuple("Archive").field(path).finish(),
            PackageSource::Directory { path } => f.debug_tuple("Directory").field(path).finish(),
        }
    }
}

impl PackageSource {
    /// Open a package, choosing the shape from the file-system type.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = fs::metadata(&path).map_err(|e| {
            LuaCordError::Descriptor(format!("cannot open {}: {e}", path.display()))
        })?;

        if metadata.is_dir() {
            debug!(path = %path.display(), "Opening directory package");
            return Ok(PackageSource::Directory { path });
        }

        let file = File::open(&path)?;
        let archive = ZipArchive::new(file).map_err(|e| {
            LuaCordError::Descriptor(format!("{} is not a valid archive: {e}", path.display()))
        })?;
        debug!(path = %path.display(), entries = archive.len(), "Opening archive package");
        Ok(PackageSource::Archive {
            path,
            archive: Mutex::new(archive),
        })
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        match self {
            PackageSource::Archive { path, .. } | PackageSource::Directory { path } => path,
        }
    }

    /// Whether this is a developer (directory) package.
    pub fn is_dev(&self) -> bool {
        matches!(self, PackageSource::Directory { .. })
    }

    /// Read a resource by package-relative path.
    ///
    /// Missing resources yield `None`. Lookup is case-sensitive.
    pub fn resource_bytes(&self, relative: &str) -> Option<Vec<u8>> {
        let relative = relative.trim_start_matches('/');
        match self {
            PackageSource::Directory { path } => {
                let target = safe_join(path, relative)?;
                if !target.is_file() {
                    return None;
                }
                fs::read(target).ok()
            }
            PackageSource::Archive { archive, .. } => {
                let mut archive = archive.lock().unwrap_or_else(|e| e.into_inner());
                let mut entry = match archive.by_name(relative) {
                    Ok(entry) => entry,
                    Err(ZipError::FileNotFound) => return None,
                    Err(e) => {
                        debug!(resource = relative, error = %e, "Archive lookup failed");
                        return None;
                    }
                };
                if entry.is_dir() {
                    return None;
                }
                let mut buf = Vec::with_capacity(initial_capacity(entry.size()));
                entry.read_to_end(&mut buf).ok()?;
                Some(buf)
            }
        }
    }

    /// Whether a resource exists.
    pub fn resource_exists(&self, relative: &str) -> bool {
        let relative = relative.trim_start_matches('/');
        match self {
            PackageSource::Directory { path } => {
                safe_join(path, relative).is_some_and(|p| p.is_file())
            }
            PackageSource::Archive { archive, .. } => {
                let archive = archive.lock().unwrap_or_else(|e| e.into_inner());
                archive.index_for_name(relative).is_some()
            }
        }
    }

    /// Bytes of the packaged `config.yml`, if any.
    pub fn default_config_bytes(&self) -> Option<Vec<u8>> {
        self.resource_bytes(DEFAULT_CONFIG_PATH)
    }

    /// Parse the package manifest.
    pub fn read_descriptor(&self) -> Result<PackageDescriptor> {
        let bytes = self.resource_bytes(DESCRIPTOR_PATH).ok_or_else(|| {
            LuaCordError::Descriptor(format!(
                "{} has no {DESCRIPTOR_PATH}",
                self.path().display()
            ))
        })?;
        PackageDescriptor::parse(&bytes)
    }
}

/// Join `relative` onto `root`, refusing absolute paths and parent escapes.
fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(joined)
}

/// Reserve at most [`MAX_PREALLOCATION`] bytes; the declared size is
/// untrusted and `read_to_end` grows the buffer as needed.
fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared.min(MAX_PREALLOCATION)).unwrap_or(0)
}
