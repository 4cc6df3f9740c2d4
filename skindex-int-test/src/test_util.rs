//! Shared fixtures: build a servable index from in-memory rows through the
//! full pipeline (loader, file install, open).

use std::fs;

use skindex::index::{IndexManager, SpatialKeywordIndex};
use skindex::loader::Loader;
use tempfile::TempDir;

pub const HEADER: &str = "FIELD DEFINITIONS\n\
    FIELD-1\tname\tT:string\n\
    FIELD-2\tlatitude\n\
    FIELD-3\tlongitude\n\
    FIELD-4\trating\tT:number\n\
    =\n";

/// Keeps the backing temp directory alive alongside the open index.
pub struct TestIndex {
    pub dir: TempDir,
    pub index: SpatialKeywordIndex,
}

/// `name \t lat \t lon \t rating` row.
pub fn row(name: &str, lat: f64, lon: f64, rating: i64) -> String {
    format!("{name}\t{lat}\t{lon}\t{rating}")
}

/// Runs the whole build pipeline on `rows` and opens the installed index.
pub fn build_index(category: &str, node_capacity: u16, rows: &[String]) -> TestIndex {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let staging_root = dir.path().join("staging");
    let live_root = dir.path().join("live");

    let staging = IndexManager::staging(&staging_root, &staging_root, category).unwrap();
    fs::write(staging.header_file(), HEADER).unwrap();
    let mut data = String::new();
    for row in rows {
        data.push_str(row);
        data.push('\n');
    }
    fs::write(staging.data_file(), data).unwrap();

    Loader::new(staging)
        .unwrap()
        .with_node_capacity(node_capacity)
        .load()
        .unwrap();

    let live = IndexManager::open(&live_root, &live_root, category);
    IndexManager::staging(&staging_root, &staging_root, category)
        .unwrap()
        .install_into(&live)
        .unwrap();

    TestIndex {
        dir,
        index: SpatialKeywordIndex::open(live).unwrap(),
    }
}
