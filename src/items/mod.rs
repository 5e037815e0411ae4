//! Item catalogs and the append consistency check.
//!
//! A catalog is the ordered, duplicate-free list of item identifiers of a
//! dataset group. Before a batch is appended, its catalog is checked
//! against the persisted one: a batch may share at most one item with the
//! store, and only when it resumes the last persisted item.

mod append;
mod catalog;

pub use append::check_appendable;
pub use catalog::{read_catalog, Catalog, Item, DEFAULT_CATALOG_NAME};
