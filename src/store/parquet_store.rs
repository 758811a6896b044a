//! Parquet-backed iteration store.
//!
//! Layout: one `iter_{:08}.parquet` file per iteration in a directory.
//!
//! | column       | type                               |
//! |--------------|------------------------------------|
//! | `seg_id`     | `UInt32`                           |
//! | `weight`     | `Float64`                          |
//! | `parent_id`  | `Int64`                            |
//! | `pcoord`     | `FixedSizeList<Float64>` of `T*D`  |
//! | `aux:<name>` | `FixedSizeList<Float64>` of `T`    |
//!
//! `T` and `D` are stored as the `n_samples` / `pcoord_ndim` attributes.
//! Row-restricted reads go through Parquet row selection, so a trace step
//! decodes one row instead of the whole iteration.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, FixedSizeListArray, Float64Array, Int64Array, RecordBatch, UInt32Array,
};
use arrow::datatypes::{DataType, Field, FieldRef, Schema};
use ndarray::{Array1, Array2, Array3};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReaderBuilder, RowSelection, RowSelector};
use tracing::debug;

use super::{IterationData, IterationStore, SegSelection};
use crate::storage::{self, column, Attributes};
use crate::{Error, Result};

const AUX_PREFIX: &str = "aux:";
const N_SAMPLES_KEY: &str = "n_samples";
const PCOORD_NDIM_KEY: &str = "pcoord_ndim";

/// Iteration store reading `iter_{:08}.parquet` files from a directory.
#[derive(Debug, Clone)]
pub struct ParquetIterationStore {
    root: PathBuf,
    n_iterations: u32,
}

fn item_field() -> FieldRef {
    Arc::new(Field::new("item", DataType::Float64, false))
}

fn list_array(values: Vec<f64>, width: usize) -> Result<ArrayRef> {
    let width = i32::try_from(width)
        .map_err(|_| Error::InvalidInput(format!("list width {width} too large")))?;
    let array =
        FixedSizeListArray::try_new(item_field(), width, Arc::new(Float64Array::from(values)), None)?;
    Ok(Arc::new(array))
}

fn list_values(list: &FixedSizeListArray) -> Result<Vec<f64>> {
    list.values()
        .as_any()
        .downcast_ref::<Float64Array>()
        .map(|values| values.values().to_vec())
        .ok_or_else(|| Error::StorageError("list column is not Float64".to_string()))
}

fn parse_attribute(attributes: &Attributes, key: &str, path: &Path) -> Result<usize> {
    attributes
        .get(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            Error::StorageError(format!("{} is missing attribute '{key}'", path.display()))
        })
}

/// Row selection covering `sorted` (ascending, unique) row indices.
fn row_selection(sorted: &[usize]) -> RowSelection {
    let mut selectors = Vec::with_capacity(sorted.len() * 2);
    let mut cursor = 0;
    for &row in sorted {
        if row > cursor {
            selectors.push(RowSelector::skip(row - cursor));
        }
        selectors.push(RowSelector::select(1));
        cursor = row + 1;
    }
    RowSelection::from(selectors)
}

impl ParquetIterationStore {
    /// Open a store directory, counting contiguous iteration files from 1.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or listed
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut n_iterations = 0;
        while Self::file_for(&root, n_iterations + 1).exists() {
            n_iterations += 1;
        }
        debug!(root = %root.display(), n_iterations, "opened parquet iteration store");

        Ok(Self { root, n_iterations })
    }

    fn file_for(root: &Path, iteration: u32) -> PathBuf {
        root.join(format!("iter_{iteration:08}.parquet"))
    }

    /// Path of an iteration file.
    #[must_use]
    pub fn iteration_path(&self, iteration: u32) -> PathBuf {
        Self::file_for(&self.root, iteration)
    }

    /// Write the next iteration (`n_iterations() + 1`).
    ///
    /// # Errors
    /// Returns error if the record is misnumbered, partial, or cannot be written
    pub fn append(&mut self, data: &IterationData) -> Result<()> {
        let expected = self.n_iterations + 1;
        if data.iteration != expected {
            return Err(Error::InvalidInput(format!(
                "expected iteration {expected}, got {}",
                data.iteration
            )));
        }
        data.validate()?;
        if data.n_particles != data.len() {
            return Err(Error::InvalidInput(format!(
                "iteration {} must contain every walker",
                data.iteration
            )));
        }

        let (rows, n_samples, ndim) = data.pcoord.dim();
        if n_samples == 0 || ndim == 0 {
            return Err(Error::InvalidInput(
                "pcoord needs at least one sample and one dimension".to_string(),
            ));
        }

        let seg_ids = data
            .seg_ids
            .iter()
            .map(|&s| u32::try_from(s))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidInput("seg_id does not fit in u32".to_string()))?;

        let mut fields = vec![
            Field::new("seg_id", DataType::UInt32, false),
            Field::new("weight", DataType::Float64, false),
            Field::new("parent_id", DataType::Int64, false),
            Field::new(
                "pcoord",
                DataType::FixedSizeList(item_field(), i32::try_from(n_samples * ndim).unwrap_or(i32::MAX)),
                false,
            ),
        ];
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(UInt32Array::from(seg_ids)),
            Arc::new(Float64Array::from(data.weights.to_vec())),
            Arc::new(Int64Array::from(data.parent_ids.to_vec())),
            list_array(data.pcoord.iter().copied().collect(), n_samples * ndim)?,
        ];
        for (name, aux) in &data.auxdata {
            let width = aux.ncols();
            fields.push(Field::new(
                format!("{AUX_PREFIX}{name}"),
                DataType::FixedSizeList(item_field(), i32::try_from(width).unwrap_or(i32::MAX)),
                false,
            ));
            columns.push(list_array(aux.iter().copied().collect(), width)?);
        }

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(Arc::clone(&schema), columns)?;
        let attributes = Attributes::from([
            (N_SAMPLES_KEY.to_string(), n_samples.to_string()),
            (PCOORD_NDIM_KEY.to_string(), ndim.to_string()),
        ]);
        storage::write_parquet(self.iteration_path(data.iteration), schema, &[batch], &attributes)?;

        debug!(iteration = data.iteration, walkers = rows, "wrote iteration");
        self.n_iterations = expected;
        Ok(())
    }

    fn builder(&self, iteration: u32) -> Result<ParquetRecordBatchReaderBuilder<File>> {
        self.check_iteration(iteration)?;
        let file = File::open(self.iteration_path(iteration))?;
        Ok(ParquetRecordBatchReaderBuilder::try_new(file)?)
    }

    fn decode(
        &self,
        iteration: u32,
        n_particles: usize,
        batch: &RecordBatch,
        attributes: &Attributes,
    ) -> Result<IterationData> {
        let path = self.iteration_path(iteration);
        let n_samples = parse_attribute(attributes, N_SAMPLES_KEY, &path)?;
        let ndim = parse_attribute(attributes, PCOORD_NDIM_KEY, &path)?;
        let rows = batch.num_rows();

        let seg_ids = column::<UInt32Array>(batch, "seg_id")?
            .values()
            .iter()
            .map(|&s| s as usize)
            .collect();
        let weights = Array1::from(column::<Float64Array>(batch, "weight")?.values().to_vec());
        let parent_ids = Array1::from(column::<Int64Array>(batch, "parent_id")?.values().to_vec());
        let pcoord = Array3::from_shape_vec(
            (rows, n_samples, ndim),
            list_values(column::<FixedSizeListArray>(batch, "pcoord")?)?,
        )
        .map_err(|e| Error::StorageError(format!("{}: bad pcoord shape: {e}", path.display())))?;

        let mut auxdata = BTreeMap::new();
        for field in batch.schema().fields() {
            let Some(name) = field.name().strip_prefix(AUX_PREFIX) else {
                continue;
            };
            let values = list_values(column::<FixedSizeListArray>(batch, field.name())?)?;
            let width = if rows == 0 { 0 } else { values.len() / rows };
            let aux = Array2::from_shape_vec((rows, width), values).map_err(|e| {
                Error::StorageError(format!("{}: bad auxdata shape: {e}", path.display()))
            })?;
            auxdata.insert(name.to_string(), aux);
        }

        let data = IterationData {
            iteration,
            n_particles,
            seg_ids,
            weights,
            parent_ids,
            pcoord,
            auxdata,
        };
        data.validate()?;
        Ok(data)
    }
}

impl IterationStore for ParquetIterationStore {
    fn n_iterations(&self) -> u32 {
        self.n_iterations
    }

    fn n_particles(&self, iteration: u32) -> Result<usize> {
        let builder = self.builder(iteration)?;
        usize::try_from(builder.metadata().file_metadata().num_rows())
            .map_err(|_| Error::StorageError(format!("negative row count in iteration {iteration}")))
    }

    fn read_iteration(&self, iteration: u32, selection: &SegSelection) -> Result<IterationData> {
        let builder = self.builder(iteration)?;
        let metadata = builder.metadata().file_metadata();
        let n_particles = usize::try_from(metadata.num_rows())
            .map_err(|_| Error::StorageError(format!("negative row count in iteration {iteration}")))?;
        let attributes: Attributes = metadata
            .key_value_metadata()
            .map(|kv| {
                kv.iter()
                    .filter_map(|e| e.value.clone().map(|v| (e.key.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();
        let schema = Arc::clone(builder.schema());

        let requested = selection.resolve(iteration, n_particles)?;
        let mut sorted = requested.clone();
        sorted.sort_unstable();
        sorted.dedup();

        let builder = match selection {
            SegSelection::All => builder,
            SegSelection::Rows(_) => builder.with_row_selection(row_selection(&sorted)),
        };
        let batches = builder
            .build()?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let batch = match batches.as_slice() {
            [] => RecordBatch::new_empty(schema),
            [single] => single.clone(),
            many => arrow::compute::concat_batches(&schema, many)?,
        };
        let decoded = self.decode(iteration, n_particles, &batch, &attributes)?;

        match selection {
            SegSelection::All => Ok(decoded),
            SegSelection::Rows(_) => {
                // Decoded rows are in ascending order; restore the requested order
                let positions: Vec<usize> = requested
                    .iter()
                    .map(|row| sorted.binary_search(row).unwrap_or_default())
                    .collect();
                Ok(decoded.take_rows(&positions))
            }
        }
    }
}
