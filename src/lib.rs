//! # Feature Store
//!
//! Persists per-item time-series feature matrices into a chunked,
//! append-only container and keeps incremental writes consistent.
//!
//! ## Core Concepts
//!
//! - **Groups**: named datasets of four lockstep arrays (`items`, `index`,
//!   `times`, `features`)
//! - **Catalogs**: the ordered, duplicate-free item list of a group
//! - **Append check**: a new batch may share at most the last stored item,
//!   which is then resumed and dropped from the batch
//! - **Journal**: unfinished appends are rolled back on the next open
//!
//! ## Example
//!
//! ```ignore
//! use featurestore::{FeatureMatrix, FeatureStore, StoreConfig};
//!
//! let store = FeatureStore::open_or_create(StoreConfig {
//!     path: "./my-features".into(),
//!     ..Default::default()
//! })?;
//!
//! let features = FeatureMatrix::from_rows(vec![vec![0.1, 0.2], vec![0.3, 0.4]])?;
//! store.write("mfcc", vec!["utt1".to_string()], vec![vec![0.0, 0.01]], vec![features])?;
//!
//! let data = store.read::<String>("mfcc")?;
//! assert_eq!(data.items, vec!["utt1"]);
//! ```

pub mod array;
pub mod error;
pub mod group;
pub mod items;
pub mod store;
pub mod types;
pub mod wal;

// Re-exports
pub use array::{ArraySpec, ArrayStore, ChunkHint, DirArrayStore, Element, ElementKind, MemoryArrayStore};
pub use error::{Result, StoreError};
pub use group::{DatasetGroup, WriteOptions};
pub use items::{check_appendable, read_catalog, Catalog, Item};
pub use store::{FeatureStore, StoreConfig};
pub use types::{
    AppendReport, FeatureFormat, FeatureMatrix, GroupData, ItemFeatures, StoreStats,
    SubStoreLengths, Verdict,
};
