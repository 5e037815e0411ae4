//! Dataset group coordinator.
//!
//! A group holds four sibling arrays kept in lockstep:
//!
//! - `items`: the catalog, one identifier per item
//! - `index`: per item, the cumulative frame count through that item
//! - `times`: one timestamp per frame
//! - `features`: one row of `dim` values per frame
//!
//! Item `k` owns rows `index[k - 1]..index[k]` of `times` and `features`.

use crate::array::{ArraySpec, ArrayStore, ChunkHint, Element};
use crate::error::{Result, StoreError};
use crate::items::{check_appendable, read_catalog, Catalog, Item, DEFAULT_CATALOG_NAME};
use crate::types::{
    AppendReport, FeatureFormat, FeatureMatrix, GroupData, ItemFeatures, SubStoreLengths, Verdict,
};

pub const INDEX_NAME: &str = "index";
pub const TIMES_NAME: &str = "times";
pub const FEATURES_NAME: &str = "features";

/// Version written to the `version` attribute of new groups.
pub const FORMAT_VERSION: &str = "1.0";

/// Options for a group write.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    pub format: FeatureFormat,
    /// Chunk sizing for a group created by this write. Ignored when the
    /// group already exists.
    pub chunk_hint: Option<ChunkHint>,
}

/// One dataset group inside an array store.
pub struct DatasetGroup<'s, S> {
    store: &'s S,
    location: String,
}

impl<'s, S: ArrayStore> DatasetGroup<'s, S> {
    pub fn new(store: &'s S, location: impl Into<String>) -> Result<Self> {
        let location = location.into();
        crate::array::validate_name("group", &location)?;
        Ok(Self { store, location })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Whether the group's catalog exists.
    pub fn exists(&self) -> bool {
        self.store.contains(&self.location, DEFAULT_CATALOG_NAME)
    }

    /// Create the four empty sub-stores for items of type `I` and features
    /// of dimension `dim`.
    pub fn create<I: Item>(&self, chunk_hint: ChunkHint, dim: usize) -> Result<()> {
        self.ensure_absent()?;
        let spec = ArraySpec::new::<I>(1, chunk_hint.records_for(I::KIND, 1))?;
        self.store
            .create_array(&self.location, DEFAULT_CATALOG_NAME, spec)?;
        self.create_siblings(chunk_hint, dim)
    }

    /// Feature dimension of an existing group.
    pub fn dim(&self) -> Result<usize> {
        Ok(self.store.array_spec(&self.location, FEATURES_NAME)?.stride as usize)
    }

    /// Feature format recorded on the group; dense when unset.
    pub fn format(&self) -> Result<FeatureFormat> {
        match self.store.attributes(&self.location)?.get("format") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(FeatureFormat::Dense),
        }
    }

    /// Append a batch of items with their times and features.
    ///
    /// Creates the group if it does not exist. Otherwise the batch is
    /// checked against the persisted catalog; a batch resuming the last
    /// stored item has that item dropped, together with its times and
    /// features, before the remaining rows are written.
    pub fn write<I: Item>(
        &self,
        items: Vec<I>,
        times: Vec<Vec<f64>>,
        features: Vec<FeatureMatrix>,
        options: &WriteOptions,
    ) -> Result<AppendReport> {
        if options.format == FeatureFormat::Sparse {
            return Err(StoreError::Unsupported(
                "writing sparse features is not implemented".into(),
            ));
        }
        if items.len() != times.len() || items.len() != features.len() {
            return Err(StoreError::LengthMismatch(format!(
                "{} items, {} time vectors, {} feature matrices",
                items.len(),
                times.len(),
                features.len()
            )));
        }

        let catalog = Catalog::new(items)?;
        let dim = validate_batch(&catalog, &times, &features)?;

        let created = !self.exists();
        let (verdict, catalog) = if created {
            let chunk_hint = options.chunk_hint.unwrap_or_default();
            self.ensure_absent()?;
            catalog.initialize_store(
                self.store,
                &self.location,
                chunk_hint.records_for(I::KIND, 1),
            )?;
            self.create_siblings(chunk_hint, dim)?;
            (Verdict::Appendable, catalog)
        } else {
            let format = self.format()?;
            if format != FeatureFormat::Dense {
                return Err(StoreError::Unsupported(format!(
                    "group {} holds {} features",
                    self.location, format
                )));
            }
            let stored_dim = self.dim()?;
            if stored_dim != dim {
                return Err(StoreError::DimensionMismatch {
                    expected: stored_dim,
                    got: dim,
                });
            }
            let persisted: Vec<I> = read_catalog(self.store, &self.location, catalog.name())?;
            check_appendable(&persisted, catalog)?
        };

        tracing::debug!(
            target: "featurestore::group",
            group = %self.location,
            ?verdict,
            created,
            "append check passed"
        );

        let skip = verdict.skipped();
        if skip > 0 {
            tracing::warn!(
                target: "featurestore::group",
                group = %self.location,
                "batch resumes the last stored item; its new rows are dropped"
            );
        }
        let features = &features[skip..];
        let times = &times[skip..];

        if catalog.is_empty() {
            return Ok(AppendReport {
                verdict,
                items_written: 0,
                frames_written: 0,
                created,
            });
        }

        let lengths = self.lengths()?;
        let index: Vec<u64> = self.store.read_all(&self.location, INDEX_NAME)?;
        let base = index.last().copied().unwrap_or(0);
        if base != lengths.times || lengths.times != lengths.features {
            return Err(StoreError::Corruption(format!(
                "group {}: index ends at row {}, times has {}, features has {}",
                self.location, base, lengths.times, lengths.features
            )));
        }

        let mut ends = Vec::with_capacity(features.len());
        let mut flat_times = Vec::new();
        let mut flat_features = Vec::new();
        let mut row = base;
        for (t, f) in times.iter().zip(features) {
            row += f.frames() as u64;
            ends.push(row);
            flat_times.extend_from_slice(t);
            flat_features.extend_from_slice(f.as_slice());
        }

        catalog.append_to_store(self.store, &self.location)?;
        self.store.append(&self.location, INDEX_NAME, &ends)?;
        self.store.append(&self.location, TIMES_NAME, &flat_times)?;
        self.store.append(&self.location, FEATURES_NAME, &flat_features)?;

        let report = AppendReport {
            verdict,
            items_written: catalog.len(),
            frames_written: flat_times.len(),
            created,
        };
        tracing::info!(
            target: "featurestore::group",
            group = %self.location,
            items = report.items_written,
            frames = report.frames_written,
            "appended batch"
        );
        Ok(report)
    }

    /// Read every item of the group, split by the index.
    pub fn read<I: Item>(&self) -> Result<GroupData<I>> {
        let items: Vec<I> = read_catalog(self.store, &self.location, DEFAULT_CATALOG_NAME)?;
        let index: Vec<u64> = self.store.read_all(&self.location, INDEX_NAME)?;
        let times: Vec<f64> = self.store.read_all(&self.location, TIMES_NAME)?;
        let features: Vec<f64> = self.store.read_all(&self.location, FEATURES_NAME)?;
        let dim = self.dim()?;

        if index.len() != items.len() {
            return Err(StoreError::Corruption(format!(
                "group {}: {} items but {} index entries",
                self.location,
                items.len(),
                index.len()
            )));
        }
        if features.len() != times.len() * dim {
            return Err(StoreError::Corruption(format!(
                "group {}: {} frames of times but {} feature values of dimension {}",
                self.location,
                times.len(),
                features.len(),
                dim
            )));
        }

        let mut entries = Vec::with_capacity(items.len());
        let mut start = 0usize;
        for &end in &index {
            let end = end as usize;
            if end < start || end > times.len() {
                return Err(StoreError::Corruption(format!(
                    "group {}: index entry {} out of order or past {} frames",
                    self.location,
                    end,
                    times.len()
                )));
            }
            entries.push(ItemFeatures {
                times: times[start..end].to_vec(),
                features: FeatureMatrix::new(dim, features[start * dim..end * dim].to_vec())?,
            });
            start = end;
        }

        Ok(GroupData { items, entries })
    }

    /// Record counts of the four sub-stores.
    pub fn lengths(&self) -> Result<SubStoreLengths> {
        Ok(SubStoreLengths {
            items: self.len_of(DEFAULT_CATALOG_NAME)?,
            index: self.len_of(INDEX_NAME)?,
            times: self.len_of(TIMES_NAME)?,
            features: self.len_of(FEATURES_NAME)?,
        })
    }

    /// Shrink each sub-store back to the given length. Sub-stores already
    /// shorter are left alone.
    pub fn truncate(&self, lengths: &SubStoreLengths) -> Result<()> {
        let current = self.lengths()?;
        let targets = [
            (FEATURES_NAME, current.features, lengths.features),
            (TIMES_NAME, current.times, lengths.times),
            (INDEX_NAME, current.index, lengths.index),
            (DEFAULT_CATALOG_NAME, current.items, lengths.items),
        ];
        for (name, now, target) in targets {
            if now > target {
                self.store.resize_array(&self.location, name, target)?;
            }
        }
        Ok(())
    }

    /// Delete the group with all its sub-stores. A missing group is fine.
    pub fn remove(&self) -> Result<()> {
        match self.store.remove_location(&self.location) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn len_of(&self, name: &str) -> Result<u64> {
        Ok(self.store.array_spec(&self.location, name)?.len)
    }

    fn ensure_absent(&self) -> Result<()> {
        let existing = [DEFAULT_CATALOG_NAME, INDEX_NAME, TIMES_NAME, FEATURES_NAME]
            .into_iter()
            .find(|name| self.store.contains(&self.location, name));
        match existing {
            Some(name) => Err(StoreError::AlreadyExists(format!(
                "{}/{}",
                self.location, name
            ))),
            None => Ok(()),
        }
    }

    fn create_siblings(&self, chunk_hint: ChunkHint, dim: usize) -> Result<()> {
        if dim == 0 {
            return Err(StoreError::InvalidArgument(
                "feature dimension must be positive".into(),
            ));
        }
        let dim = u32::try_from(dim)
            .map_err(|_| StoreError::InvalidArgument(format!("feature dimension {} too large", dim)))?;

        self.create_array::<u64>(INDEX_NAME, 1, chunk_hint)?;
        self.create_array::<f64>(TIMES_NAME, 1, chunk_hint)?;
        self.create_array::<f64>(FEATURES_NAME, dim, chunk_hint)?;

        self.store.set_attribute(
            &self.location,
            "format",
            serde_json::to_value(FeatureFormat::Dense)?,
        )?;
        self.store
            .set_attribute(&self.location, "version", serde_json::json!(FORMAT_VERSION))?;

        tracing::info!(
            target: "featurestore::group",
            group = %self.location,
            dim,
            "created group"
        );
        Ok(())
    }

    fn create_array<T: Element>(&self, name: &str, stride: u32, chunk_hint: ChunkHint) -> Result<()> {
        let spec = ArraySpec::new::<T>(stride, chunk_hint.records_for(T::KIND, stride))?;
        self.store.create_array(&self.location, name, spec)
    }
}

/// Check per-item shapes and return the common feature dimension.
fn validate_batch<I: Item>(
    catalog: &Catalog<I>,
    times: &[Vec<f64>],
    features: &[FeatureMatrix],
) -> Result<usize> {
    let dim = features.first().map(FeatureMatrix::dim).ok_or(StoreError::EmptyInput)?;
    for ((item, t), f) in catalog.items().iter().zip(times).zip(features) {
        if f.dim() != dim {
            return Err(StoreError::DimensionMismatch {
                expected: dim,
                got: f.dim(),
            });
        }
        if t.len() != f.frames() {
            return Err(StoreError::LengthMismatch(format!(
                "item {:?}: {} timestamps for {} frames",
                item,
                t.len(),
                f.frames()
            )));
        }
    }
    Ok(dim)
}
