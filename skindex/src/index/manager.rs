//! Per-category file management: naming, snapshot and node-file I/O, node
//! preloading, and the backup-and-rollback installation of a freshly built
//! index over the serving one.
//!
//! A category's files live under `<data_path>/<category>/` (data, header)
//! and `<index_path>/<category>/` (snapshot, nodes, node map, bitmap
//! store). A manager opened in staging mode suffixes everything except the
//! bitmap store with `.tmp`; staging builds run against their own paths and
//! are installed with [`IndexManager::install_into`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::errors::{IndexError, IndexResult};
use crate::rtree::{
    Node, NodeFileReader, NodeFileWriter, NodeOffsetMap, NodeRef, Rtree, RtreeSnapshot,
};
use crate::store::BitmapStore;

pub const DATA_SUFFIX: &str = ".asc";
pub const HEADER_SUFFIX: &str = ".asc.header";
pub const SNAPSHOT_SUFFIX: &str = ".index";
pub const NODES_SUFFIX: &str = ".rtn";
pub const NODE_MAP_SUFFIX: &str = ".rtm";
pub const BITMAP_SUFFIX: &str = ".bitmaps";

const TEMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = ".bkp";

/// Everything persisted in the `.index` file: the dataset description, the
/// tree summary, and the build timestamp.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub dataset: Dataset,
    pub tree: RtreeSnapshot,
    pub last_built: DateTime<Utc>,
}

pub struct IndexManager {
    data_path: PathBuf,
    index_path: PathBuf,
    category: String,
    staging: bool,
}

impl IndexManager {
    /// A manager over the serving file set.
    pub fn open(
        data_path: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            index_path: index_path.into(),
            category: category.into(),
            staging: false,
        }
    }

    /// A manager over `.tmp`-suffixed staging files; creates the category
    /// directories.
    pub fn staging(
        data_path: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
        category: impl Into<String>,
    ) -> IndexResult<Self> {
        let manager = Self {
            data_path: data_path.into(),
            index_path: index_path.into(),
            category: category.into(),
            staging: true,
        };
        fs::create_dir_all(manager.data_path.join(&manager.category))?;
        fs::create_dir_all(manager.index_path.join(&manager.category))?;
        Ok(manager)
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    fn file(&self, base: &Path, suffix: &str) -> PathBuf {
        let name = if self.staging {
            format!("{}{suffix}{TEMP_SUFFIX}", self.category)
        } else {
            format!("{}{suffix}", self.category)
        };
        base.join(&self.category).join(name)
    }

    pub fn data_file(&self) -> PathBuf {
        self.file(&self.data_path, DATA_SUFFIX)
    }

    pub fn header_file(&self) -> PathBuf {
        self.file(&self.data_path, HEADER_SUFFIX)
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.file(&self.index_path, SNAPSHOT_SUFFIX)
    }

    pub fn nodes_file(&self) -> PathBuf {
        self.file(&self.index_path, NODES_SUFFIX)
    }

    pub fn node_map_file(&self) -> PathBuf {
        self.file(&self.index_path, NODE_MAP_SUFFIX)
    }

    /// The bitmap store directory. Never `.tmp`-suffixed: staging managers
    /// use a distinct index path instead, so the store engine sees a stable
    /// name in both modes.
    pub fn bitmap_store_dir(&self) -> PathBuf {
        self.index_path
            .join(&self.category)
            .join(format!("{}{BITMAP_SUFFIX}", self.category))
    }

    /// An intermediate build file under the category's index directory.
    pub fn scratch_file(&self, suffix: &str) -> PathBuf {
        self.index_path
            .join(&self.category)
            .join(format!("{}{suffix}", self.category))
    }

    pub fn open_bitmap_store(&self) -> IndexResult<BitmapStore> {
        BitmapStore::open(&self.category, &self.index_path)
    }

    // ========================================================================
    // Node file
    // ========================================================================

    /// Drains a built tree's arena into the node file and persists the
    /// offset map. Replaces any previous pair.
    pub fn write_nodes(&self, tree: &Rtree) -> IndexResult<()> {
        remove_if_exists(&self.nodes_file())?;
        remove_if_exists(&self.node_map_file())?;

        let mut writer = NodeFileWriter::create(&self.nodes_file())?;
        for node in tree.arena().iter() {
            writer.write_node(node)?;
        }
        let map = writer.finish()?;
        map.save(&self.node_map_file())?;

        log::info!(
            "category {}: persisted {} tree nodes",
            self.category,
            map.len()
        );
        Ok(())
    }

    pub fn load_node_map(&self) -> IndexResult<NodeOffsetMap> {
        NodeOffsetMap::load(&self.node_map_file())
    }

    /// One reader per query; readers never share a file cursor.
    pub fn open_node_reader(&self, offsets: Arc<NodeOffsetMap>) -> IndexResult<NodeFileReader> {
        NodeFileReader::open(&self.nodes_file(), offsets)
    }

    /// Reads the top `levels` of the tree below `root` into memory so the
    /// hottest node pages never hit the file at query time. Fewer than two
    /// levels is not worth pinning.
    pub fn preload_upper_nodes(
        &self,
        reader: &mut NodeFileReader,
        root: &Node,
        levels: u16,
    ) -> IndexResult<HashMap<NodeRef, Node>> {
        let mut nodes = HashMap::new();
        self.preload_into(reader, root, levels, &mut nodes)?;
        if !nodes.is_empty() {
            log::info!(
                "category {}: preloaded {} upper-level nodes",
                self.category,
                nodes.len()
            );
        }
        Ok(nodes)
    }

    fn preload_into(
        &self,
        reader: &mut NodeFileReader,
        node: &Node,
        levels: u16,
        out: &mut HashMap<NodeRef, Node>,
    ) -> IndexResult<()> {
        if levels < 2 || node.is_leaf() {
            return Ok(());
        }

        for entry in &node.entries {
            let child = reader.read_node(entry.child)?;
            self.preload_into(reader, &child, levels - 1, out)?;
            out.insert(entry.child, child);
        }
        Ok(())
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    pub fn write_snapshot(&self, snapshot: &IndexSnapshot) -> IndexResult<()> {
        let bytes = bincode::serde::encode_to_vec(snapshot, bincode::config::legacy())
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        fs::write(self.snapshot_file(), bytes)?;
        Ok(())
    }

    /// Reads the snapshot and re-points its dataset at this manager's data
    /// and header files (the persisted paths belong to the machine and mode
    /// that built it).
    pub fn read_snapshot(&self) -> IndexResult<IndexSnapshot> {
        let bytes = fs::read(self.snapshot_file())?;
        let (mut snapshot, _): (IndexSnapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                .map_err(|e| IndexError::Serialization(e.to_string()))?;

        snapshot.dataset = Dataset::open(self.data_file(), self.header_file())?;
        Ok(snapshot)
    }

    // ========================================================================
    // Installation
    // ========================================================================

    fn managed_files(&self) -> [PathBuf; 6] {
        [
            self.data_file(),
            self.header_file(),
            self.snapshot_file(),
            self.nodes_file(),
            self.node_map_file(),
            self.bitmap_store_dir(),
        ]
    }

    /// Installs this staging build over `live`'s file set: back up the
    /// current files, copy the staged ones in, and roll back from the
    /// backups if any copy fails. The serving index stays usable whenever
    /// this returns an error.
    pub fn install_into(&self, live: &IndexManager) -> IndexResult<()> {
        let staged = self.managed_files();
        let current = live.managed_files();

        log::info!("category {}: starting file switch", self.category);

        for path in &current {
            remove_path(&backup_name(path))?;
        }

        let current_exists = current.iter().all(|p| p.exists());
        if current_exists {
            log::info!("category {}: backing up current index", self.category);
            for path in &current {
                if let Err(e) = copy_path(path, &backup_name(path)) {
                    log::error!(
                        "category {}: backup of {} failed: {e}",
                        self.category,
                        path.display()
                    );
                    return Err(IndexError::BuildFailed {
                        stage: "install backup".into(),
                        message: e.to_string(),
                    });
                }
            }
        } else {
            // A partial file set cannot serve; clear it out.
            for path in &current {
                remove_path(path)?;
            }
        }

        log::info!("category {}: replacing data and index files", self.category);
        let mut failed = None;
        for (from, to) in staged.iter().zip(&current) {
            if let Err(e) = copy_path(from, to) {
                log::error!(
                    "category {}: could not replace {}: {e}",
                    self.category,
                    to.display()
                );
                failed = Some(e);
                break;
            }
        }

        match failed {
            None => {
                log::info!("category {}: index is fresh", self.category);
                for path in &current {
                    remove_path(&backup_name(path))?;
                }
                for path in &staged {
                    remove_path(path)?;
                }
                Ok(())
            }
            Some(e) => {
                log::error!("category {}: rolling back file switch", self.category);
                if current_exists {
                    for path in &current {
                        if let Err(restore) = copy_path(&backup_name(path), path) {
                            log::error!(
                                "category {}: could not restore {}: {restore}",
                                self.category,
                                path.display()
                            );
                        }
                    }
                }
                Err(IndexError::BuildFailed {
                    stage: "install".into(),
                    message: e.to_string(),
                })
            }
        }
    }
}

fn backup_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> IndexResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes a file or directory tree, tolerating absence.
fn remove_path(path: &Path) -> IndexResult<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Copies a file or a whole directory tree, creating parents as needed.
fn copy_path(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_path(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to).map(|_| ())
    }
}
