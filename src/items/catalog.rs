//! Ordered, duplicate-free item catalog.

use crate::array::{ArraySpec, ArrayStore, Element};
use crate::error::{Result, StoreError};
use std::collections::BTreeSet;
use std::fmt;

/// Name of the catalog array inside a group.
pub const DEFAULT_CATALOG_NAME: &str = "items";

/// An item identifier: storable, totally ordered and printable.
pub trait Item: Element + Ord + fmt::Debug {}

impl<T: Element + Ord + fmt::Debug> Item for T {}

/// Ordered list of unique item identifiers.
#[derive(Clone, Debug)]
pub struct Catalog<I> {
    items: Vec<I>,
    name: String,
}

impl<I: Item> Catalog<I> {
    /// Build a catalog named `items`.
    ///
    /// Fails if `items` is empty or holds the same identifier twice.
    pub fn new(items: Vec<I>) -> Result<Self> {
        Self::with_name(items, DEFAULT_CATALOG_NAME)
    }

    /// Build a catalog stored under a custom array name.
    pub fn with_name(items: Vec<I>, name: impl Into<String>) -> Result<Self> {
        if items.is_empty() {
            return Err(StoreError::EmptyInput);
        }

        let mut seen = BTreeSet::new();
        for item in &items {
            if !seen.insert(item) {
                return Err(StoreError::DuplicateItem(format!("{:?}", item)));
            }
        }

        Ok(Self {
            items,
            name: name.into(),
        })
    }

    /// Identifiers in insertion order.
    pub fn items(&self) -> &[I] {
        &self.items
    }

    /// Number of identifiers.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Only a trimmed catalog can be empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Name of the backing array.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The leading identifier, if any.
    pub fn first(&self) -> Option<&I> {
        self.items.first()
    }

    /// Consume the catalog, returning its identifiers.
    pub fn into_items(self) -> Vec<I> {
        self.items
    }

    /// Drop the leading item.
    pub(crate) fn without_first(mut self) -> Self {
        if !self.items.is_empty() {
            self.items.remove(0);
        }
        self
    }

    /// Create the zero-length, growable catalog array at `location`.
    pub fn initialize_store<S: ArrayStore>(
        &self,
        store: &S,
        location: &str,
        chunk_records: u64,
    ) -> Result<()> {
        let spec = ArraySpec::new::<I>(1, chunk_records)?;
        store.create_array(location, &self.name, spec)
    }

    /// Append the identifiers at the tail of the catalog array.
    ///
    /// The array must have been created by [`Catalog::initialize_store`].
    pub fn append_to_store<S: ArrayStore>(&self, store: &S, location: &str) -> Result<()> {
        if self.items.is_empty() {
            return Ok(());
        }
        store.append(location, &self.name, &self.items)?;
        Ok(())
    }
}

/// Equal when the identifier sequences are equal; the name is ignored.
impl<I: PartialEq> PartialEq for Catalog<I> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<I: Eq> Eq for Catalog<I> {}

/// Read the persisted catalog of a location.
pub fn read_catalog<I: Item, S: ArrayStore>(
    store: &S,
    location: &str,
    name: &str,
) -> Result<Vec<I>> {
    store.read_all(location, name)
}
