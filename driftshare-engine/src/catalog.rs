use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, ensure};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use driftshare_core::protocol::CHUNK_SIZE;

/// The local set of shareable files, as seen by the server.
///
/// The engine only reads through this interface; adding and removing
/// files is the owner's business.
pub trait Catalog: Send + Sync + 'static {
    /// Names currently offered to peers.
    fn list_names(&self) -> Vec<String>;

    /// Local path of the file shared under `name`.
    fn resolve(&self, name: &str) -> Option<PathBuf>;

    /// Hex-encoded SHA-256 of the file at `path`.
    fn content_hash(&self, path: &Path) -> Option<String>;

    /// Current size of the file at `path`, `None` if it cannot be read.
    fn size_of(&self, path: &Path) -> Option<u64>;
}

/// Computes the hex-encoded SHA-256 of a file, reading it in
/// [`CHUNK_SIZE`] pieces.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One entry of a [`SharedCatalog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedEntry {
    pub path: PathBuf,
    pub size: u64,
    pub hash: String,
    /// Unix seconds at which the file was shared.
    pub added_at: u64,
}

/// Totals over a catalog's live entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatalogSummary {
    pub total_files: usize,
    pub total_size: u64,
}

/// A name → file mapping, optionally persisted as pretty JSON.
///
/// Names are file names; sharing two files with the same name keeps the
/// most recent one.
#[derive(Debug, Default)]
pub struct SharedCatalog {
    db_path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, SharedEntry>>,
}

impl SharedCatalog {
    /// A catalog that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the catalog stored at `db_path`, starting empty if the file
    /// does not exist yet or cannot be parsed.
    pub fn open(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let entries = match fs::read_to_string(&db_path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, SharedEntry>>(&content) {
                Ok(entries) => {
                    info!(path = %db_path.display(), files = entries.len(), "Loaded shared catalog");
                    entries
                }
                Err(e) => {
                    warn!(path = %db_path.display(), error = %e, "Failed to parse shared catalog, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %db_path.display(), error = %e, "Failed to read shared catalog, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            db_path: Some(db_path),
            entries: RwLock::new(entries),
        }
    }

    /// Shares the file at `path` under its file name and returns that name.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not a readable regular file or the
    /// catalog cannot be persisted.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let metadata =
            fs::metadata(path).with_context(|| format!("cannot read {}", path.display()))?;
        ensure!(metadata.is_file(), "{} is not a regular file", path.display());

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let hash = sha256_file(path).with_context(|| format!("cannot hash {}", path.display()))?;
        let added_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let entry = SharedEntry {
            path: path.to_path_buf(),
            size: metadata.len(),
            hash,
            added_at,
        };

        {
            let mut entries = self.entries.write();
            if entries.get(&name).is_some_and(|e| e.hash == entry.hash && e.path == entry.path) {
                debug!(name = %name, "File already shared");
                return Ok(name);
            }
            entries.insert(name.clone(), entry);
        }
        self.save()?;
        info!(name = %name, "File shared");
        Ok(name)
    }

    /// Stops sharing `name`. Returns whether it was shared.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be persisted.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed = self.entries.write().remove(name).is_some();
        if removed {
            self.save()?;
            info!(name = %name, "File unshared");
        }
        Ok(removed)
    }

    /// Drops every entry whose file disappeared and returns their names.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be persisted.
    pub fn prune_missing(&self) -> Result<Vec<String>> {
        let pruned: Vec<String> = {
            let mut entries = self.entries.write();
            let missing: Vec<String> = entries
                .iter()
                .filter(|(_, e)| !e.path.is_file())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &missing {
                entries.remove(name);
            }
            missing
        };
        if !pruned.is_empty() {
            self.save()?;
            info!(count = pruned.len(), "Pruned missing shared files");
        }
        Ok(pruned)
    }

    /// Snapshot of every entry, sorted by name.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, SharedEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(name, e)| (name.clone(), e.clone()))
            .collect()
    }

    /// File count and total size over entries whose file still exists.
    #[must_use]
    pub fn summary(&self) -> CatalogSummary {
        self.entries
            .read()
            .values()
            .filter(|e| e.path.is_file())
            .fold(CatalogSummary::default(), |acc, e| CatalogSummary {
                total_files: acc.total_files + 1,
                total_size: acc.total_size + e.size,
            })
    }

    fn save(&self) -> Result<()> {
        let Some(db_path) = &self.db_path else {
            return Ok(());
        };
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&*self.entries.read())?;
        fs::write(db_path, json).with_context(|| format!("cannot write {}", db_path.display()))?;
        debug!(path = %db_path.display(), "Saved shared catalog");
        Ok(())
    }
}

impl Catalog for SharedCatalog {
    fn list_names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.path.is_file())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.path.clone())
            .filter(|p| p.is_file())
    }

    fn content_hash(&self, path: &Path) -> Option<String> {
        match sha256_file(path) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to hash shared file");
                None
            }
        }
    }

    fn size_of(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().filter(fs::Metadata::is_file).map(|m| m.len())
    }
}
