//! In-process array store.

use super::chunk;
use super::{validate_name, ArraySpec, ArrayStore, Element};
use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct MemLocation {
    arrays: BTreeMap<String, MemArray>,
    attributes: BTreeMap<String, serde_json::Value>,
}

struct MemArray {
    spec: ArraySpec,
    chunks: HashMap<u64, Vec<u8>>,
}

/// Array store held entirely in memory, using the same chunk encoding as
/// [`DirArrayStore`](super::DirArrayStore).
#[derive(Default)]
pub struct MemoryArrayStore {
    locations: RwLock<BTreeMap<String, MemLocation>>,
}

impl MemoryArrayStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_array<R>(
        &self,
        location: &str,
        name: &str,
        f: impl FnOnce(&mut MemArray) -> Result<R>,
    ) -> Result<R> {
        let mut locations = self.locations.write();
        let array = locations
            .get_mut(location)
            .and_then(|loc| loc.arrays.get_mut(name))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", location, name)))?;
        f(array)
    }
}

impl ArrayStore for MemoryArrayStore {
    fn create_array(&self, location: &str, name: &str, spec: ArraySpec) -> Result<()> {
        validate_name("location", location)?;
        validate_name("array", name)?;

        let mut locations = self.locations.write();
        let loc = locations.entry(location.to_string()).or_default();
        if loc.arrays.contains_key(name) {
            return Err(StoreError::AlreadyExists(format!("{}/{}", location, name)));
        }
        loc.arrays.insert(
            name.to_string(),
            MemArray {
                spec: ArraySpec { len: 0, ..spec },
                chunks: HashMap::new(),
            },
        );
        Ok(())
    }

    fn resize_array(&self, location: &str, name: &str, new_len: u64) -> Result<()> {
        self.with_array(location, name, |array| {
            chunk::truncate_records(&mut array.chunks, &array.spec, new_len)?;
            array.spec.len = new_len;
            Ok(())
        })
    }

    fn write_range<T: Element>(
        &self,
        location: &str,
        name: &str,
        start: u64,
        values: &[T],
    ) -> Result<()> {
        self.with_array(location, name, |array| {
            chunk::write_records(&mut array.chunks, &array.spec, start, values)
        })
    }

    fn read_all<T: Element>(&self, location: &str, name: &str) -> Result<Vec<T>> {
        self.with_array(location, name, |array| {
            chunk::read_records(&mut array.chunks, &array.spec)
        })
    }

    fn array_spec(&self, location: &str, name: &str) -> Result<ArraySpec> {
        self.locations
            .read()
            .get(location)
            .and_then(|loc| loc.arrays.get(name))
            .map(|array| array.spec)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", location, name)))
    }

    fn contains(&self, location: &str, name: &str) -> bool {
        self.locations
            .read()
            .get(location)
            .map_or(false, |loc| loc.arrays.contains_key(name))
    }

    fn set_attribute(&self, location: &str, key: &str, value: serde_json::Value) -> Result<()> {
        validate_name("location", location)?;
        self.locations
            .write()
            .entry(location.to_string())
            .or_default()
            .attributes
            .insert(key.to_string(), value);
        Ok(())
    }

    fn attributes(&self, location: &str) -> Result<BTreeMap<String, serde_json::Value>> {
        Ok(self
            .locations
            .read()
            .get(location)
            .map(|loc| loc.attributes.clone())
            .unwrap_or_default())
    }

    fn remove_location(&self, location: &str) -> Result<()> {
        self.locations
            .write()
            .remove(location)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(location.to_string()))
    }

    fn locations(&self) -> Result<Vec<String>> {
        Ok(self.locations.read().keys().cloned().collect())
    }
}
