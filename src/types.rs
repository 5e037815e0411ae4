//! Core types for the feature store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk layout of the feature rows of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeatureFormat {
    /// One row of `dim` values per frame.
    #[default]
    Dense,
    /// Reserved. Writing sparse features is not implemented.
    Sparse,
}

impl FeatureFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureFormat::Dense => "dense",
            FeatureFormat::Sparse => "sparse",
        }
    }
}

impl fmt::Display for FeatureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row-major matrix of `frames x dim` feature values for one item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    dim: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    /// Build a matrix from flat row-major data.
    pub fn new(dim: usize, data: Vec<f64>) -> Result<Self> {
        if dim == 0 {
            return Err(StoreError::DimensionMismatch {
                expected: 1,
                got: 0,
            });
        }
        if data.len() % dim != 0 {
            return Err(StoreError::LengthMismatch(format!(
                "{} values do not fill rows of dimension {}",
                data.len(),
                dim
            )));
        }
        Ok(Self { dim, data })
    }

    /// Build a matrix from rows. All rows must share one length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let dim = rows.first().map(Vec::len).ok_or(StoreError::EmptyInput)?;
        let mut data = Vec::with_capacity(dim * rows.len());
        for row in rows {
            if row.len() != dim {
                return Err(StoreError::DimensionMismatch {
                    expected: dim,
                    got: row.len(),
                });
            }
            data.extend(row);
        }
        Self::new(dim, data)
    }

    /// A matrix of `frames` rows filled with zeros.
    pub fn zeros(frames: usize, dim: usize) -> Result<Self> {
        Self::new(dim, vec![0.0; frames * dim])
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of frames (rows).
    pub fn frames(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn row(&self, frame: usize) -> Option<&[f64]> {
        let start = frame.checked_mul(self.dim)?;
        self.data.get(start..start + self.dim)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }
}

/// Outcome of the append consistency check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// No item is shared with the persisted catalog; the whole batch is new.
    Appendable,
    /// The batch resumes the last persisted item, which was dropped from it.
    AppendableWithTrim,
}

impl Verdict {
    /// Number of leading batch entries dropped by the check.
    pub fn skipped(&self) -> usize {
        match self {
            Verdict::Appendable => 0,
            Verdict::AppendableWithTrim => 1,
        }
    }
}

/// What a group write actually persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendReport {
    pub verdict: Verdict,
    /// Items appended to the catalog.
    pub items_written: usize,
    /// Frames appended to `times` and `features`.
    pub frames_written: usize,
    /// Whether the group was created by this write.
    pub created: bool,
}

/// Record counts of the four sub-stores of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubStoreLengths {
    pub items: u64,
    pub index: u64,
    pub times: u64,
    pub features: u64,
}

/// Times and features of one stored item.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemFeatures {
    pub times: Vec<f64>,
    pub features: FeatureMatrix,
}

/// Everything stored in a group, in catalog order.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupData<I> {
    pub items: Vec<I>,
    pub entries: Vec<ItemFeatures>,
}

impl<I: PartialEq> GroupData<I> {
    /// Look up one item's data.
    pub fn get(&self, item: &I) -> Option<&ItemFeatures> {
        let pos = self.items.iter().position(|i| i == item)?;
        self.entries.get(pos)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    pub group_count: u64,
    pub item_count: u64,
    pub frame_count: u64,
    pub total_size_bytes: u64,
}
