//! # skindex - Disk-Resident Spatial Keyword Index
//!
//! skindex answers top-k spatial Boolean queries: the k records nearest a
//! query point that satisfy keyword and numeric predicates. Records live in
//! tab-delimited dataset files; the index is an R-tree whose leaf entries
//! are grouped into super nodes, paired with a spatial inverted file of
//! compressed per-term bitmaps over those super nodes. The best-first
//! search walks the tree nearest-first and consults the bitmaps lazily, so
//! subtrees with no keyword match are skipped without touching their nodes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use skindex::query::QuerySpec;
//! use skindex::registry::IndexRegistry;
//! use skindex::rtree::Point;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = IndexRegistry::new("/var/sk/data", "/var/sk/index", "/var/sk/staging");
//!
//! // Build a category from its staged raw files, then query it.
//! registry.reload("business")?;
//! let query = QuerySpec::nearest(Point::new(-80.19, 25.76), 5000.0, 10);
//! for hit in registry.search("business", &query)? {
//!     println!("{}\t{}\t{}", hit.data, hit.distance_meters, hit.compass);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Layout
//!
//! - [`dataset`]: header-driven schema, record parsing and cleansing
//! - [`rtree`]: the packed R-tree, its node file and the query snapshot
//! - [`bitmap`], [`store`]: compressed bitmaps and their LSM-backed store
//! - [`sif`]: the spatial inverted file over super nodes
//! - [`query`]: predicates and the best-first result iterator
//! - [`index`], [`loader`], [`registry`]: serving handles, the staged build
//!   pipeline, and the category registry that ties them together

pub mod bitmap;
pub mod dataset;
pub mod errors;
pub mod index;
pub mod loader;
pub mod query;
pub mod registry;
pub mod rtree;
pub mod sif;
pub mod store;

pub use errors::{IndexError, IndexResult};
