//! Category registry: the serving-side map from category name to its open
//! index, with load orchestration layered on top.
//!
//! A category moves between three states: loading (a build is running,
//! watchers can see its stage and record count), ready (queries are served),
//! and failed (the last build error is kept for status reporting). A reload
//! keeps serving the previous index until the freshly built one is
//! installed, so a failed build never takes a category offline.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::errors::{IndexError, IndexResult};
use crate::index::{Index, IndexManager, SpatialKeywordIndex};
use crate::loader::{LoadStage, LoadState, Loader};
use crate::query::{QuerySpec, ScoredRecord};
use crate::rtree::Point;

// ============================================================================
// States and projections
// ============================================================================

enum CategoryState {
    Loading {
        progress: Arc<LoadState>,
        /// Still-serving index from before the reload, if any; retired
        /// just before the file swap.
        previous: Option<Arc<SpatialKeywordIndex>>,
    },
    Ready(Arc<SpatialKeywordIndex>),
    Failed(String),
}

/// Point-in-time view of a category for status reporting.
#[derive(Debug)]
pub struct CategoryStatus {
    pub category: String,
    pub stage: Option<LoadStage>,
    pub records_processed: u64,
    pub last_built: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A search hit projected for output: the raw record plus synthesized
/// distance and compass-direction columns.
#[derive(Debug)]
pub struct QueryHit {
    pub data: String,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_meters: f64,
    pub compass: String,
    pub member: usize,
}

impl QueryHit {
    fn project(query_point: Point, scored: &ScoredRecord) -> Self {
        let result_point = Point::new(
            scored.record.longitude() as f32,
            scored.record.latitude() as f32,
        );
        Self {
            data: scored.record.data().to_owned(),
            latitude: scored.record.latitude(),
            longitude: scored.record.longitude(),
            distance_meters: scored.distance,
            compass: compass_direction(query_point, result_point),
            member: scored.member,
        }
    }
}

/// N/S from latitude, E/W from longitude; a hit exactly at the query point
/// reads as north.
pub fn compass_direction(search: Point, result: Point) -> String {
    let mut compass = String::new();

    if search.y < result.y {
        compass.push('N');
    } else if search.y > result.y {
        compass.push('S');
    }

    if search.x < result.x {
        compass.push('E');
    } else if search.x > result.x {
        compass.push('W');
    }

    if compass.is_empty() {
        compass.push('N');
    }
    compass
}

// ============================================================================
// Registry
// ============================================================================

pub struct IndexRegistry {
    data_path: PathBuf,
    index_path: PathBuf,
    staging_path: PathBuf,
    categories: DashMap<String, CategoryState>,
}

impl IndexRegistry {
    /// `staging_path` hosts in-flight builds; it must not overlap the
    /// serving paths.
    pub fn new(
        data_path: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
        staging_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            index_path: index_path.into(),
            staging_path: staging_path.into(),
            categories: DashMap::new(),
        }
    }

    fn live_manager(&self, category: &str) -> IndexManager {
        IndexManager::open(&self.data_path, &self.index_path, category)
    }

    /// Directory staged builds of `category` expect their raw data in.
    pub fn staging_data_dir(&self, category: &str) -> PathBuf {
        self.staging_path.join(category)
    }

    pub fn categories(&self) -> Vec<String> {
        self.categories.iter().map(|e| e.key().clone()).collect()
    }

    /// Opens an already-installed category from disk and starts serving it.
    pub fn open(&self, category: &str) -> IndexResult<Arc<SpatialKeywordIndex>> {
        if let Some(state) = self.categories.get(category) {
            if matches!(*state, CategoryState::Loading { .. }) {
                return Err(IndexError::LoadInProgress(category.to_owned()));
            }
        }

        let index = Arc::new(SpatialKeywordIndex::open(self.live_manager(category))?);
        self.categories
            .insert(category.to_owned(), CategoryState::Ready(Arc::clone(&index)));
        Ok(index)
    }

    /// The serving index for a category. During a reload this is the
    /// previous build until the install swap begins; a category whose only
    /// build failed is gone.
    pub fn get(&self, category: &str) -> IndexResult<Arc<SpatialKeywordIndex>> {
        match self.categories.get(category).as_deref() {
            Some(CategoryState::Ready(index)) => Ok(Arc::clone(index)),
            Some(CategoryState::Loading {
                previous: Some(index),
                ..
            }) => Ok(Arc::clone(index)),
            Some(CategoryState::Loading { previous: None, .. }) => {
                Err(IndexError::LoadInProgress(category.to_owned()))
            }
            Some(CategoryState::Failed(_)) | None => {
                Err(IndexError::CategoryNotFound(category.to_owned()))
            }
        }
    }

    /// Runs a search and projects every hit for output.
    pub fn search(&self, category: &str, query: &QuerySpec) -> IndexResult<Vec<QueryHit>> {
        let index = self.get(category)?;
        let mut hits = Vec::new();
        for scored in index.search(query)? {
            hits.push(QueryHit::project(query.point, &scored?));
        }
        Ok(hits)
    }

    /// Builds the category from the staged raw files and installs the
    /// result. Runs on the caller's thread; other threads observe progress
    /// through [`IndexRegistry::status`] and keep querying the previous
    /// build. At most one load per category runs at a time.
    pub fn reload(&self, category: &str) -> IndexResult<Arc<SpatialKeywordIndex>> {
        let staging =
            IndexManager::staging(&self.staging_path, &self.staging_path, category)?;
        let loader = Loader::new(staging)?;
        self.claim_load(category, loader.state())?;

        match self.run_load(category, &loader) {
            Ok(index) => {
                self.categories
                    .insert(category.to_owned(), CategoryState::Ready(Arc::clone(&index)));
                Ok(index)
            }
            Err(e) => {
                log::error!("category {category}: load failed: {e}");
                self.categories
                    .insert(category.to_owned(), CategoryState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Marks the category as loading, keeping any serving index visible.
    fn claim_load(&self, category: &str, progress: Arc<LoadState>) -> IndexResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.categories.entry(category.to_owned()) {
            Entry::Occupied(mut entry) => {
                let previous = match entry.get() {
                    CategoryState::Loading { .. } => {
                        return Err(IndexError::LoadInProgress(category.to_owned()))
                    }
                    CategoryState::Ready(index) => Some(Arc::clone(index)),
                    CategoryState::Failed(_) => None,
                };
                entry.insert(CategoryState::Loading { progress, previous });
            }
            Entry::Vacant(entry) => {
                entry.insert(CategoryState::Loading {
                    progress,
                    previous: None,
                });
            }
        }
        Ok(())
    }

    fn run_load(&self, category: &str, loader: &Loader) -> IndexResult<Arc<SpatialKeywordIndex>> {
        loader.load()?;

        // The install rewrites the live files the previous index reads, so
        // it must be retired first; for the brief swap window `get` answers
        // `LoadInProgress`.
        if let Some(mut state) = self.categories.get_mut(category) {
            if let CategoryState::Loading { previous, .. } = state.value_mut() {
                if let Some(old) = previous.take() {
                    if let Err(e) = old.close() {
                        log::warn!("category {category}: closing previous index: {e}");
                    }
                }
            }
        }

        let staging =
            IndexManager::staging(&self.staging_path, &self.staging_path, category)?;
        let live = self.live_manager(category);
        staging.install_into(&live)?;

        Ok(Arc::new(SpatialKeywordIndex::open(live)?))
    }

    /// Requests cancellation of a running load; the loading thread notices
    /// at its next checkpoint.
    pub fn cancel_load(&self, category: &str) -> IndexResult<()> {
        match self.categories.get(category).as_deref() {
            Some(CategoryState::Loading { progress, .. }) => {
                progress.cancel();
                Ok(())
            }
            _ => Err(IndexError::CategoryNotFound(category.to_owned())),
        }
    }

    /// Drops the category from serving and closes its store.
    pub fn unload(&self, category: &str) -> IndexResult<()> {
        match self.categories.remove(category) {
            Some((_, CategoryState::Ready(index))) => index.close(),
            Some(_) => Ok(()),
            None => Err(IndexError::CategoryNotFound(category.to_owned())),
        }
    }

    pub fn status(&self, category: &str) -> IndexResult<CategoryStatus> {
        let state = self
            .categories
            .get(category)
            .ok_or_else(|| IndexError::CategoryNotFound(category.to_owned()))?;

        let status = match state.value() {
            CategoryState::Loading { progress, previous } => CategoryStatus {
                category: category.to_owned(),
                stage: Some(progress.stage()),
                records_processed: progress.records_processed(),
                last_built: previous.as_ref().map(|i| i.last_built()),
                error: None,
            },
            CategoryState::Ready(index) => CategoryStatus {
                category: category.to_owned(),
                stage: None,
                records_processed: 0,
                last_built: Some(index.last_built()),
                error: None,
            },
            CategoryState::Failed(message) => CategoryStatus {
                category: category.to_owned(),
                stage: None,
                records_processed: 0,
                last_built: None,
                error: Some(message.clone()),
            },
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ComparisonOperator, TextPredicate};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    const HEADER: &str = "FIELD DEFINITIONS\n\
        FIELD-1\tname\tT:string\n\
        FIELD-2\tlatitude\n\
        FIELD-3\tlongitude\n\
        =\n";

    fn registry(root: &Path) -> IndexRegistry {
        IndexRegistry::new(root.join("data"), root.join("index"), root.join("staging"))
    }

    fn stage_rows(registry: &IndexRegistry, category: &str, rows: &[&str]) {
        let dir = registry.staging_data_dir(category);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(format!("{category}.asc.header.tmp")),
            HEADER,
        )
        .unwrap();
        let mut data = String::new();
        for row in rows {
            data.push_str(row);
            data.push('\n');
        }
        fs::write(dir.join(format!("{category}.asc.tmp")), data).unwrap();
    }

    #[test]
    fn test_reload_then_query() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        stage_rows(
            &registry,
            "poi",
            &[
                "corner cafe\t0.0\t0.0",
                "green park\t0.5\t0.5",
                "river cafe\t1.0\t1.0",
            ],
        );

        registry.reload("poi").unwrap();

        let query = QuerySpec::nearest(Point::new(0.0, 0.0), 1e7, 10);
        let hits = registry.search("poi", &query).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits[0].data.contains("corner cafe"));
        assert_eq!(hits[0].compass, "N");
        assert_eq!(hits[1].compass, "NE");

        let status = registry.status("poi").unwrap();
        assert!(status.last_built.is_some());
        assert!(status.error.is_none());
    }

    #[test]
    fn test_reload_retires_previous_index_before_swap() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        stage_rows(&registry, "poi", &["corner cafe\t0.0\t0.0"]);
        registry.reload("poi").unwrap();
        let old = registry.get("poi").unwrap();

        stage_rows(
            &registry,
            "poi",
            &["corner cafe\t0.0\t0.0", "river cafe\t1.0\t1.0"],
        );
        registry.reload("poi").unwrap();

        let mut query = QuerySpec::nearest(Point::new(0.0, 0.0), 1e7, 10);
        query.text_predicates = vec![TextPredicate::new(
            vec!["cafe".to_owned()],
            ComparisonOperator::Equal,
            None,
        )];

        // The retired handle's store was closed before its files were
        // replaced; the freshly installed build serves instead.
        assert!(old.search(&query).is_err());
        let hits = registry.search("poi", &query).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_unknown_category() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        assert!(matches!(
            registry.get("nowhere"),
            Err(IndexError::CategoryNotFound(_))
        ));
        assert!(matches!(
            registry.status("nowhere"),
            Err(IndexError::CategoryNotFound(_))
        ));
    }

    #[test]
    fn test_failed_load_is_reported() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        // No staged files: the loader cannot even open the dataset.
        assert!(registry.reload("poi").is_err());
        // Nothing was ever claimed, so the category stays unknown.
        assert!(registry.get("poi").is_err());
    }

    #[test]
    fn test_compass_directions() {
        let origin = Point::new(0.0, 0.0);
        assert_eq!(compass_direction(origin, Point::new(0.0, 1.0)), "N");
        assert_eq!(compass_direction(origin, Point::new(1.0, -1.0)), "SE");
        assert_eq!(compass_direction(origin, Point::new(-1.0, 0.0)), "W");
        assert_eq!(compass_direction(origin, origin), "N");
    }
}
