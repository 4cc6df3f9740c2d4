//! Staged build pipeline turning a raw dataset into a servable index.
//!
//! The stages run in a fixed order: tree build, leaf-id dump, node
//! persistence, forward-index generation, external sort/join, term bitmap
//! build, snapshot write. Everything lands in the staging manager's file
//! set; installing the result over the serving files is the caller's step.
//! Progress and cancellation travel through a shared [`LoadState`] so a
//! status endpoint can watch a load it did not start.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::dataset::{Dataset, DatasetReader};
use crate::errors::{IndexError, IndexResult};
use crate::index::{IndexManager, IndexSnapshot};
use crate::rtree::{NumericRange, Point, Rtree};
use crate::sif::SpatialInvertedFile;

/// Fanout of production trees; also the super-node edge length.
pub const NODE_CAPACITY: u16 = 80;
const FILL_FACTOR: f32 = 0.5;

const PROGRESS_LOG_INTERVAL: u64 = 1_000_000;
const CANCEL_CHECK_INTERVAL: u64 = 8192;

// ============================================================================
// Load state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Idle,
    TreeBuild,
    LeafDump,
    NodePersist,
    ForwardIndex,
    SortJoin,
    TermBitmaps,
    SnapshotWrite,
    Done,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStage::Idle => "idle",
            LoadStage::TreeBuild => "tree build",
            LoadStage::LeafDump => "leaf dump",
            LoadStage::NodePersist => "node persist",
            LoadStage::ForwardIndex => "forward index",
            LoadStage::SortJoin => "sort/join",
            LoadStage::TermBitmaps => "term bitmaps",
            LoadStage::SnapshotWrite => "snapshot write",
            LoadStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Shared progress handle: the loading thread writes, watchers read, anyone
/// may cancel. Cancellation is honored at record-batch and stage boundaries.
pub struct LoadState {
    stage: Mutex<LoadStage>,
    records_processed: AtomicU64,
    cancelled: AtomicBool,
}

impl LoadState {
    fn new() -> Self {
        Self {
            stage: Mutex::new(LoadStage::Idle),
            records_processed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn stage(&self) -> LoadStage {
        *self.stage.lock()
    }

    /// Records handled in the current stage.
    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Loader
// ============================================================================

pub struct Loader {
    dataset: Dataset,
    manager: IndexManager,
    node_capacity: u16,
    state: Arc<LoadState>,
}

impl Loader {
    /// Builds against a staging manager whose data and header files are
    /// already in place.
    pub fn new(manager: IndexManager) -> IndexResult<Self> {
        let dataset = Dataset::open(manager.data_file(), manager.header_file())?;
        Ok(Self {
            dataset,
            manager,
            node_capacity: NODE_CAPACITY,
            state: Arc::new(LoadState::new()),
        })
    }

    /// Small trees are easier to exercise end to end.
    pub fn with_node_capacity(mut self, capacity: u16) -> Self {
        self.node_capacity = capacity;
        self
    }

    pub fn state(&self) -> Arc<LoadState> {
        Arc::clone(&self.state)
    }

    fn enter_stage(&self, stage: LoadStage) -> IndexResult<()> {
        self.check_cancelled(stage)?;
        *self.state.stage.lock() = stage;
        self.state.records_processed.store(0, Ordering::Relaxed);
        log::info!("category {}: stage {stage}", self.manager.category());
        Ok(())
    }

    fn check_cancelled(&self, stage: LoadStage) -> IndexResult<()> {
        if self.state.is_cancelled() {
            return Err(IndexError::BuildFailed {
                stage: stage.to_string(),
                message: "load cancelled".into(),
            });
        }
        Ok(())
    }

    /// Runs the whole pipeline. On error the staging files may be left in
    /// any intermediate shape; the serving file set is never touched.
    pub fn load(&self) -> IndexResult<()> {
        let num_field_count = self.dataset.schema().number_field_indexes().len();
        let mut tree = Rtree::new(self.node_capacity, FILL_FACTOR, num_field_count)?;

        self.enter_stage(LoadStage::TreeBuild)?;
        self.build_tree(&mut tree)?;

        self.enter_stage(LoadStage::LeafDump)?;
        let dnode_file = self.manager.scratch_file(".dnode");
        {
            let mut out = BufWriter::new(File::create(&dnode_file)?);
            tree.dump_leaf_entry_ids(&mut out)?;
            out.flush()?;
        }

        self.enter_stage(LoadStage::NodePersist)?;
        self.manager.write_nodes(&tree)?;
        let snapshot = tree.snapshot();
        tree.release_working_set();

        self.enter_stage(LoadStage::ForwardIndex)?;
        let fidx_file = self.manager.scratch_file(".fidx");
        let fidx0_file = self.manager.scratch_file(".fidx0");
        self.build_forward_index(&fidx_file, &fidx0_file)?;

        self.enter_stage(LoadStage::SortJoin)?;
        let text_file = self.manager.scratch_file(".text");
        self.sort_and_join(&dnode_file, &fidx_file, &text_file)?;
        for leftover in [&dnode_file, &fidx_file, &fidx0_file] {
            let _ = fs::remove_file(leftover);
        }

        self.enter_stage(LoadStage::TermBitmaps)?;
        // A reused staging directory may hold a store from an aborted run.
        match fs::remove_dir_all(self.manager.bitmap_store_dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let store = self.manager.open_bitmap_store()?;
        let boundaries =
            (!snapshot.boundaries().is_empty()).then(|| snapshot.boundaries().clone());
        let sif = SpatialInvertedFile::new(store, snapshot.capacity(), boundaries);
        let bundles = sif.build_term_bitmaps(BufReader::new(File::open(&text_file)?))?;
        sif.store().close()?;
        let _ = fs::remove_file(&text_file);
        log::info!(
            "category {}: {bundles} term bitmap bundles",
            self.manager.category()
        );

        self.enter_stage(LoadStage::SnapshotWrite)?;
        self.manager.write_snapshot(&IndexSnapshot {
            dataset: self.dataset.clone(),
            tree: snapshot,
            last_built: Utc::now(),
        })?;

        *self.state.stage.lock() = LoadStage::Done;
        Ok(())
    }

    /// First dataset pass: coordinates and numeric summaries only.
    /// Malformed rows are logged and skipped; their byte offsets stay
    /// unreferenced so queries never see them.
    fn build_tree(&self, tree: &mut Rtree) -> IndexResult<()> {
        let mut reader = DatasetReader::open(&self.dataset)?;
        let mut line = 0u64;

        loop {
            line += 1;
            if line % CANCEL_CHECK_INTERVAL == 0 {
                self.check_cancelled(LoadStage::TreeBuild)?;
            }

            match reader.read_record(false, true) {
                Ok(Some(record)) => {
                    let point =
                        Point::new(record.longitude() as f32, record.latitude() as f32);
                    let num_range = record
                        .numeric_values()
                        .map(|vs| NumericRange::from_values(vs.iter().map(|v| *v as f32).collect()));
                    tree.insert_point(record.reference(), point, num_range);

                    let processed =
                        self.state.records_processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if processed % PROGRESS_LOG_INTERVAL == 0 {
                        log::info!(
                            "category {}: {processed} records indexed",
                            self.manager.category()
                        );
                    }
                }
                Ok(None) => break,
                Err(IndexError::MalformedRecord(message)) => {
                    log::warn!(
                        "category {}: line {line} skipped: {message}",
                        self.manager.category()
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Second dataset pass: one `record_ref \t term \t field` row per unique
    /// (term, field) of each record. Empty terms and zero numeric values go
    /// to the sibling `.fidx0` file, which stays out of the join; absence
    /// and zero are the same thing to the inverted file.
    fn build_forward_index(&self, fidx_file: &Path, fidx0_file: &Path) -> IndexResult<()> {
        let text_fields = self.dataset.schema().text_field_indexes().to_vec();
        let number_fields = self.dataset.schema().number_field_indexes().to_vec();
        if text_fields.is_empty() {
            File::create(fidx_file)?;
            File::create(fidx0_file)?;
            return Ok(());
        }

        let mut reader = DatasetReader::open(&self.dataset)?;
        let mut out = BufWriter::new(File::create(fidx_file)?);
        let mut out0 = BufWriter::new(File::create(fidx0_file)?);
        let mut seen: HashSet<(String, usize)> = HashSet::new();
        let mut line = 0u64;

        loop {
            line += 1;
            if line % CANCEL_CHECK_INTERVAL == 0 {
                self.check_cancelled(LoadStage::ForwardIndex)?;
            }

            let record = match reader.read_record(true, true) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(IndexError::MalformedRecord(_)) => continue,
                Err(e) => return Err(e),
            };

            seen.clear();
            let reference = record.reference();

            if let Some(values) = record.text_values() {
                for (i, value) in values.iter().enumerate() {
                    let field = text_fields[i];
                    for term in value.split(' ') {
                        if !seen.insert((term.to_owned(), field)) {
                            continue;
                        }
                        let sink: &mut BufWriter<File> =
                            if term.is_empty() { &mut out0 } else { &mut out };
                        writeln!(sink, "{reference}\t{term}\t{field}")?;
                    }
                }
            }

            if let Some(values) = record.numeric_values() {
                for (i, value) in values.iter().enumerate() {
                    if *value == 0.0 {
                        writeln!(out0, "{reference}\t\t{}", number_fields[i])?;
                    }
                }
            }

            self.state.records_processed.fetch_add(1, Ordering::Relaxed);
        }

        out.flush()?;
        out0.flush()?;
        Ok(())
    }

    /// Joins the leaf-id dump against the forward index with the platform
    /// sort and join tools, leaving `term \t field \t entry_id` rows sorted
    /// by term then entry id. `LC_ALL=C` pins the collation the join
    /// requires.
    fn sort_and_join(
        &self,
        dnode_file: &Path,
        fidx_file: &Path,
        text_file: &Path,
    ) -> IndexResult<()> {
        let dnode_sorted = self.manager.scratch_file(".dnode.srt");
        let fidx_sorted = self.manager.scratch_file(".fidx.srt");
        let text_unsorted = self.manager.scratch_file(".text.raw");

        run_command(
            "sort dnode",
            Command::new("sort")
                .env("LC_ALL", "C")
                .args(["-t", "\t", "-k1,1", "-o"])
                .arg(&dnode_sorted)
                .arg(dnode_file),
        )?;

        run_command(
            "sort fidx",
            Command::new("sort")
                .env("LC_ALL", "C")
                .args(["-t", "\t", "-k1,1", "-o"])
                .arg(&fidx_sorted)
                .arg(fidx_file),
        )?;

        run_command(
            "join dnode/fidx",
            Command::new("join")
                .env("LC_ALL", "C")
                .args(["-t", "\t", "-o", "2.2,2.3,1.2"])
                .arg(&dnode_sorted)
                .arg(&fidx_sorted)
                .stdout(Stdio::from(File::create(&text_unsorted)?)),
        )?;

        run_command(
            "sort text",
            Command::new("sort")
                .env("LC_ALL", "C")
                .args(["-t", "\t", "-k1,1", "-k3,3n", "-o"])
                .arg(text_file)
                .arg(&text_unsorted),
        )?;

        for leftover in [&dnode_sorted, &fidx_sorted, &text_unsorted] {
            let _ = fs::remove_file(leftover);
        }
        Ok(())
    }
}

fn run_command(label: &str, command: &mut Command) -> IndexResult<()> {
    let status = command.status().map_err(|e| IndexError::BuildFailed {
        stage: label.to_string(),
        message: e.to_string(),
    })?;

    if !status.success() {
        return Err(IndexError::ExternalCommand {
            command: label.to_string(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Index, SpatialKeywordIndex};
    use crate::query::{ComparisonOperator, QuerySpec, TextPredicate};
    use tempfile::tempdir;

    const HEADER: &str = "FIELD DEFINITIONS\n\
        FIELD-1\tname\tT:string\n\
        FIELD-2\tlatitude\n\
        FIELD-3\tlongitude\n\
        FIELD-4\trating\tT:number\n\
        =\n";

    fn seed_dataset(manager: &IndexManager, rows: &[&str]) {
        fs::write(manager.header_file(), HEADER).unwrap();
        let mut data = String::new();
        for row in rows {
            data.push_str(row);
            data.push('\n');
        }
        fs::write(manager.data_file(), data).unwrap();
    }

    fn sample_rows() -> Vec<String> {
        // A cluster of cafes near the origin and parks further out.
        let mut rows = Vec::new();
        for i in 0..40 {
            let name = if i % 2 == 0 { "corner cafe" } else { "green park" };
            rows.push(format!(
                "{name}\t{}\t{}\t{}",
                0.01 * i as f64,
                0.01 * i as f64,
                i % 7
            ));
        }
        rows
    }

    #[test]
    fn test_full_pipeline_and_search() {
        let dir = tempdir().unwrap();
        let staging = IndexManager::staging(dir.path().join("s"), dir.path().join("s"), "poi")
            .unwrap();
        let rows = sample_rows();
        seed_dataset(&staging, &rows.iter().map(String::as_str).collect::<Vec<_>>());

        let loader = Loader::new(staging).unwrap().with_node_capacity(4);
        loader.load().unwrap();
        assert_eq!(loader.state().stage(), LoadStage::Done);

        let live_root = dir.path().join("live");
        let live = IndexManager::open(&live_root, &live_root, "poi");
        let staging = IndexManager::staging(dir.path().join("s"), dir.path().join("s"), "poi")
            .unwrap();
        staging.install_into(&live).unwrap();

        let index = SpatialKeywordIndex::open(live).unwrap();
        let mut query = QuerySpec::nearest(Point::new(0.0, 0.0), 1e7, 3);
        query.text_predicates = vec![TextPredicate::new(
            vec!["cafe".into()],
            ComparisonOperator::Equal,
            None,
        )];

        let results: Vec<_> = index
            .search(&query)
            .unwrap()
            .collect::<IndexResult<Vec<_>>>()
            .unwrap();

        assert_eq!(results.len(), 3);
        // Nearest-first and keyword-filtered.
        for pair in results.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
        for result in &results {
            assert!(result.record.data().contains("cafe"));
        }
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = tempdir().unwrap();
        let staging = IndexManager::staging(dir.path(), dir.path(), "poi").unwrap();
        seed_dataset(
            &staging,
            &[
                "corner cafe\t1.0\t1.0\t5",
                "not enough fields",
                "corner cafe\t2.0\t2.0\t5",
            ],
        );

        let loader = Loader::new(staging).unwrap().with_node_capacity(4);
        loader.load().unwrap();
        assert_eq!(loader.state().stage(), LoadStage::Done);
    }

    #[test]
    fn test_cancel_aborts_the_load() {
        let dir = tempdir().unwrap();
        let staging = IndexManager::staging(dir.path(), dir.path(), "poi").unwrap();
        let rows = sample_rows();
        seed_dataset(&staging, &rows.iter().map(String::as_str).collect::<Vec<_>>());

        let loader = Loader::new(staging).unwrap().with_node_capacity(4);
        loader.state().cancel();

        match loader.load() {
            Err(IndexError::BuildFailed { message, .. }) => {
                assert_eq!(message, "load cancelled");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
