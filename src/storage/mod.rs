//! Derived dataset storage (Arrow/Parquet)
//!
//! Every derived dataset (`assign`, `direct`, `reweight`) is one Parquet
//! file. Its root attributes live in the Parquet key-value metadata; the
//! cache reads `arg_hash` from there and never interprets it as data.
//!
//! Write pattern:
//! - A stage writes the file once, unstamped
//! - The cache stamps it by rewriting into a temporary sibling and renaming
//!   over the original, so a reader sees either the old file or the new one
//! - Callers only ever hold read-only [`DerivedFile`] snapshots

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, RecordBatch};
use arrow::datatypes::SchemaRef;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::{Error, Result};

/// Metadata key holding the cache content hash.
pub const ARG_HASH_KEY: &str = "arg_hash";

/// Metadata key holding the RFC 3339 stamp time.
pub const GENERATED_AT_KEY: &str = "generated_at";

/// Metadata key the Arrow writer manages itself.
const ARROW_SCHEMA_KEY: &str = "ARROW:schema";

/// String attributes stored at the root of a derived file.
pub type Attributes = BTreeMap<String, String>;

/// Read-only snapshot of a derived Parquet file.
#[derive(Debug, Clone)]
pub struct DerivedFile {
    path: PathBuf,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    attributes: Attributes,
}

fn attributes_from(kv: Option<&Vec<KeyValue>>) -> Attributes {
    kv.map(|entries| {
        entries
            .iter()
            .filter(|e| e.key != ARROW_SCHEMA_KEY)
            .filter_map(|e| e.value.clone().map(|v| (e.key.clone(), v)))
            .collect()
    })
    .unwrap_or_default()
}

impl DerivedFile {
    /// Load a derived file with all of its batches and attributes.
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::StorageError(format!("Failed to open {}: {e}", path.display()))
        })?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            Error::StorageError(format!("Failed to parse {}: {e}", path.display()))
        })?;
        let attributes = attributes_from(builder.metadata().file_metadata().key_value_metadata());
        let schema = Arc::clone(builder.schema());

        let reader = builder.build().map_err(|e| {
            Error::StorageError(format!("Failed to create Parquet reader: {e}"))
        })?;

        let mut batches = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| {
                Error::StorageError(format!("Failed to read record batch: {e}"))
            })?;
            batches.push(batch);
        }

        Ok(Self {
            path: path.to_path_buf(),
            schema,
            batches,
            attributes,
        })
    }

    /// File location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All record batches.
    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Root attributes (excluding Arrow's own schema entry).
    #[must_use]
    pub const fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// One attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Required attribute.
    ///
    /// # Errors
    /// Returns `Error::StorageError` if the attribute is absent
    pub fn require_attribute(&self, key: &str) -> Result<&str> {
        self.attribute(key).ok_or_else(|| {
            Error::StorageError(format!(
                "{} is missing attribute '{key}'",
                self.path.display()
            ))
        })
    }

    /// Stamped content hash, if any.
    #[must_use]
    pub fn arg_hash(&self) -> Option<&str> {
        self.attribute(ARG_HASH_KEY)
    }

    /// Total row count.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// All batches concatenated into one.
    ///
    /// # Errors
    /// Returns error if batches cannot be combined
    pub fn combined(&self) -> Result<RecordBatch> {
        match self.batches.as_slice() {
            [] => Ok(RecordBatch::new_empty(Arc::clone(&self.schema))),
            [single] => Ok(single.clone()),
            batches => arrow::compute::concat_batches(&self.schema, batches)
                .map_err(|e| Error::StorageError(format!("Failed to combine batches: {e}"))),
        }
    }
}

/// Write batches plus root attributes to a Parquet file.
///
/// # Errors
/// Returns error if the file cannot be created or a batch does not match the schema
pub fn write_parquet<P: AsRef<Path>>(
    path: P,
    schema: SchemaRef,
    batches: &[RecordBatch],
    attributes: &Attributes,
) -> Result<()> {
    let kv: Vec<KeyValue> = attributes
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();
    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(kv))
        .build();

    let file = File::create(path.as_ref())?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;
    Ok(())
}

/// Read only the stamped hash (footer read, no column data).
///
/// # Errors
/// Returns error if the file is missing or not valid Parquet
pub fn read_arg_hash<P: AsRef<Path>>(path: P) -> Result<Option<String>> {
    let file = File::open(path.as_ref())?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let attributes = attributes_from(builder.metadata().file_metadata().key_value_metadata());
    Ok(attributes.get(ARG_HASH_KEY).cloned())
}

/// Stamp `arg_hash` (and the stamp time) into a file and reopen it read-only.
///
/// # Errors
/// Returns error if the file cannot be read, rewritten or renamed
pub fn stamp_hash<P: AsRef<Path>>(path: P, hash: &str) -> Result<DerivedFile> {
    let path = path.as_ref();
    let existing = DerivedFile::open(path)?;

    let mut attributes = existing.attributes.clone();
    attributes.insert(ARG_HASH_KEY.to_string(), hash.to_string());
    attributes.insert(
        GENERATED_AT_KEY.to_string(),
        chrono::Utc::now().to_rfc3339(),
    );

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".stamping");
    let tmp = PathBuf::from(tmp);
    write_parquet(&tmp, Arc::clone(&existing.schema), &existing.batches, &attributes)?;
    std::fs::rename(&tmp, path)?;

    DerivedFile::open(path)
}

/// Downcast a named column, with a storage error naming the file on failure.
///
/// # Errors
/// Returns `Error::StorageError` if the column is missing or has another type
pub fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::StorageError(format!("Column not found: {name}")))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::StorageError(format!("Column '{name}' has an unexpected type")))
}
