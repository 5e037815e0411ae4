//! Chunked, growable array storage.
//!
//! An array is a sequence of fixed-stride records (`stride` scalars each)
//! split into chunks of `chunk_records` records. Arrays live under a
//! named location (a dataset group) and only grow by resize-then-write.

mod chunk;
mod dir;
mod memory;

pub use dir::DirArrayStore;
pub use memory::MemoryArrayStore;

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

/// Scalar type held by an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    Str,
    F64,
    U64,
    I64,
}

impl ElementKind {
    /// Approximate encoded size of one scalar, used to size chunks.
    pub fn approx_bytes(&self) -> u64 {
        match self {
            ElementKind::Str => 32,
            ElementKind::F64 | ElementKind::U64 | ElementKind::I64 => 8,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::Str => "str",
            ElementKind::F64 => "f64",
            ElementKind::U64 => "u64",
            ElementKind::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// A scalar that can be stored in an array.
///
/// Records added by a resize and never written read back as `Default`.
pub trait Element: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {
    const KIND: ElementKind;
}

impl Element for String {
    const KIND: ElementKind = ElementKind::Str;
}

impl Element for f64 {
    const KIND: ElementKind = ElementKind::F64;
}

impl Element for u64 {
    const KIND: ElementKind = ElementKind::U64;
}

impl Element for i64 {
    const KIND: ElementKind = ElementKind::I64;
}

/// Shape and layout of one array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySpec {
    pub kind: ElementKind,
    /// Scalars per record.
    pub stride: u32,
    /// Records per chunk.
    pub chunk_records: u64,
    /// Current length in records.
    pub len: u64,
}

impl ArraySpec {
    /// A zero-length array of `T` records.
    pub fn new<T: Element>(stride: u32, chunk_records: u64) -> Result<Self> {
        if stride == 0 {
            return Err(StoreError::InvalidArgument("stride must be positive".into()));
        }
        if chunk_records == 0 {
            return Err(StoreError::InvalidArgument(
                "records per chunk must be positive".into(),
            ));
        }
        let spec = Self {
            kind: T::KIND,
            stride,
            chunk_records,
            len: 0,
        };
        spec.chunk_scalars()?;
        Ok(spec)
    }

    /// Scalars per chunk. Bounded by the `u32` count of the chunk header.
    pub(crate) fn chunk_scalars(&self) -> Result<u64> {
        match self.chunk_records.checked_mul(self.stride as u64) {
            Some(n) if n <= MAX_CHUNK_SCALARS => Ok(n),
            _ => Err(StoreError::InvalidArgument(format!(
                "{} records of stride {} exceed {} scalars per chunk",
                self.chunk_records, self.stride, MAX_CHUNK_SCALARS
            ))),
        }
    }

    /// Scalar offset of record `records`.
    pub(crate) fn scalars(&self, records: u64) -> Result<u64> {
        records.checked_mul(self.stride as u64).ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "{} records of stride {} overflow the scalar range",
                records, self.stride
            ))
        })
    }

    pub(crate) fn check_kind<T: Element>(&self) -> Result<()> {
        if self.kind != T::KIND {
            return Err(StoreError::TypeMismatch {
                expected: self.kind.to_string(),
                got: T::KIND.to_string(),
            });
        }
        Ok(())
    }
}

/// Most scalars a single chunk may hold.
pub const MAX_CHUNK_SCALARS: u64 = u32::MAX as u64;

/// How large the chunks of a new array should be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkHint {
    /// Fixed number of records per chunk.
    Records(NonZeroU64),
    /// Target chunk size in bytes; converted per array from its record size.
    Bytes(NonZeroU64),
}

impl ChunkHint {
    /// Records per chunk for an array of `kind` with the given stride.
    pub fn records_for(&self, kind: ElementKind, stride: u32) -> u64 {
        match self {
            ChunkHint::Records(n) => n.get(),
            ChunkHint::Bytes(bytes) => {
                let record_bytes = kind.approx_bytes() * stride.max(1) as u64;
                (bytes.get() / record_bytes).max(1)
            }
        }
    }
}

impl Default for ChunkHint {
    fn default() -> Self {
        // 0.1 MB, the historical default chunk size
        ChunkHint::Bytes(NonZeroU64::new(100 * 1024).unwrap_or(NonZeroU64::MIN))
    }
}

/// Storage capability for chunked arrays grouped under locations.
pub trait ArrayStore {
    /// Create a zero-length growable array.
    fn create_array(&self, location: &str, name: &str, spec: ArraySpec) -> Result<()>;

    /// Grow or shrink an array to `new_len` records.
    fn resize_array(&self, location: &str, name: &str, new_len: u64) -> Result<()>;

    /// Overwrite records `start..start + values.len() / stride`.
    ///
    /// The range must lie inside the current length.
    fn write_range<T: Element>(
        &self,
        location: &str,
        name: &str,
        start: u64,
        values: &[T],
    ) -> Result<()>;

    /// Read every scalar of the array, in record order.
    fn read_all<T: Element>(&self, location: &str, name: &str) -> Result<Vec<T>>;

    fn array_spec(&self, location: &str, name: &str) -> Result<ArraySpec>;

    fn contains(&self, location: &str, name: &str) -> bool;

    /// Set a JSON attribute on a location.
    fn set_attribute(&self, location: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// All attributes of a location (empty if none were set).
    fn attributes(&self, location: &str) -> Result<BTreeMap<String, serde_json::Value>>;

    /// Delete a location with all its arrays and attributes.
    fn remove_location(&self, location: &str) -> Result<()>;

    /// Names of all locations, sorted.
    fn locations(&self) -> Result<Vec<String>>;

    /// Resize by the number of records in `values` and write them at the tail.
    ///
    /// Returns the record offset the values were written at.
    fn append<T: Element>(&self, location: &str, name: &str, values: &[T]) -> Result<u64> {
        let spec = self.array_spec(location, name)?;
        let stride = spec.stride as usize;
        if values.len() % stride != 0 {
            return Err(StoreError::LengthMismatch(format!(
                "{} values do not fill records of stride {}",
                values.len(),
                stride
            )));
        }
        let start = spec.len;
        let count = (values.len() / stride) as u64;
        if count == 0 {
            return Ok(start);
        }
        self.resize_array(location, name, start + count)?;
        self.write_range(location, name, start, values)?;
        Ok(start)
    }
}

/// Location and array names must be a single, plain path segment.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.chars().any(char::is_control);
    if bad {
        return Err(StoreError::InvalidArgument(format!(
            "invalid {} name: {:?}",
            kind, name
        )));
    }
    Ok(())
}
