//! Analysis Pipeline Cache
//!
//! Keeps the three derived datasets of a scheme (`assign`, `direct`,
//! `reweight`) current. Each file carries the hash of the inputs it was
//! generated from; a file whose stamp is missing, unreadable or different
//! from the expected hash is regenerated, and regenerating `assign`
//! regenerates everything downstream of it.
//!
//! ## Guarantees
//!
//! - A dataset handed back is either a previously verified file or a file
//!   that was stamped after its stage returned successfully.
//! - A stage failure aborts the call. Whatever the failed stage left on
//!   disk carries no stamp and is regenerated by the next call.
//! - Staleness is never reported as an error.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ensemble_ipa::cache::{CacheOptions, PipelineCache};
//! use ensemble_ipa::config::AnalysisSettings;
//! use ensemble_ipa::scheme::SchemeRegistry;
//! use ensemble_ipa::store::ParquetIterationStore;
//!
//! # fn example() -> ensemble_ipa::Result<()> {
//! let settings = AnalysisSettings::from_path("analysis.json")?;
//! let registry = SchemeRegistry::from_settings(&settings)?;
//! let store = ParquetIterationStore::open("traj_segs")?;
//!
//! let cache = PipelineCache::new(CacheOptions::default());
//! let datasets = cache.ensure_fresh(&store, registry.active())?;
//! println!("regenerated: {:?}", datasets.regenerated);
//! # Ok(())
//! # }
//! ```

mod hash;

pub use hash::{ArgHash, CACHE_KEY_VERSION};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::scheme::AnalysisScheme;
use crate::stages::{AssignDataset, BuiltinStages, KineticsDataset, StageContext, StagePipeline};
use crate::storage::{self, DerivedFile, GENERATED_AT_KEY};
use crate::store::IterationStore;
use crate::{Error, Result};

/// The derived datasets of a scheme, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetName {
    /// State/bin labels
    Assign,
    /// Kinetics from raw counts
    Direct,
    /// Kinetics from the reweighted transition matrix
    Reweight,
}

impl DatasetName {
    /// All datasets, upstream first.
    pub const ALL: [Self; 3] = [Self::Assign, Self::Direct, Self::Reweight];

    /// Dataset name as written in files and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::Direct => "direct",
            Self::Reweight => "reweight",
        }
    }

    /// File name inside the scheme directory.
    #[must_use]
    pub fn file_name(self) -> String {
        format!("{}.parquet", self.as_str())
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown dataset '{s}'")))
    }
}

/// Cache behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Regenerate every dataset regardless of stamps
    pub reanalyze: bool,
    /// Stage worker threads (0 = rayon default)
    pub workers: usize,
}

/// A verified derived dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    /// Which dataset
    pub name: DatasetName,
    /// File location
    pub path: PathBuf,
    /// Stamped content hash (hex)
    pub arg_hash: String,
    /// Stamp time, RFC 3339
    pub generated_at: Option<String>,
    /// Decoded contents
    pub data: T,
}

/// The fresh datasets of one scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemeDatasets {
    /// Scheme these belong to
    pub scheme: String,
    /// Iterations covered
    pub n_iterations: u32,
    /// Assignment labels
    pub assign: CacheEntry<AssignDataset>,
    /// Direct kinetics
    pub direct: CacheEntry<KineticsDataset>,
    /// Reweighting kinetics; `None` when post-analysis is disabled
    pub reweight: Option<CacheEntry<KineticsDataset>>,
    /// Datasets regenerated by this call, in the order they were produced
    pub regenerated: Vec<DatasetName>,
}

/// Why a dataset has to be regenerated.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Staleness {
    Current,
    Missing,
    Unreadable(String),
    Unstamped,
    HashMismatch,
    Forced,
    UpstreamRegenerated,
}

impl Staleness {
    const fn is_current(&self) -> bool {
        matches!(self, Self::Current)
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::Missing => f.write_str("missing"),
            Self::Unreadable(e) => write!(f, "unreadable ({e})"),
            Self::Unstamped => f.write_str("no arg_hash"),
            Self::HashMismatch => f.write_str("arg_hash mismatch"),
            Self::Forced => f.write_str("reanalyze requested"),
            Self::UpstreamRegenerated => f.write_str("upstream regenerated"),
        }
    }
}

/// Regenerates stale derived datasets through a [`StagePipeline`].
pub struct PipelineCache {
    options: CacheOptions,
    stages: Arc<dyn StagePipeline>,
}

impl fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl PipelineCache {
    /// Cache driving the built-in stages.
    #[must_use]
    pub fn new(options: CacheOptions) -> Self {
        Self::with_stages(options, Arc::new(BuiltinStages))
    }

    /// Cache driving custom stage implementations.
    #[must_use]
    pub fn with_stages(options: CacheOptions, stages: Arc<dyn StagePipeline>) -> Self {
        Self { options, stages }
    }

    /// Current options.
    #[must_use]
    pub const fn options(&self) -> CacheOptions {
        self.options
    }

    /// Make every dataset of `scheme` current and return them decoded.
    ///
    /// Order is `assign`, then `direct`, then `reweight` (only when the
    /// scheme enables post-analysis). Regenerating `assign` forces both
    /// kinetics datasets to regenerate in the same call, and their keys
    /// include the `assign` stamp so a later call still sees them as stale
    /// if this one fails part way.
    ///
    /// Callers must not run two `ensure_fresh` calls against the same
    /// scheme directory at once.
    ///
    /// # Errors
    ///
    /// Returns `Error::StageFailure` naming the dataset whose stage failed,
    /// or an I/O error if the scheme directory cannot be created
    pub fn ensure_fresh(
        &self,
        store: &dyn IterationStore,
        scheme: &AnalysisScheme,
    ) -> Result<SchemeDatasets> {
        let started = Instant::now();
        std::fs::create_dir_all(scheme.directory())?;

        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("ensemble-ipa-stage-{i}"));
        if self.options.workers > 0 {
            builder = builder.num_threads(self.options.workers);
        }
        let pool = builder
            .build()
            .map_err(|e| Error::InvalidInput(format!("cannot start stage workers: {e}")))?;

        let n_iterations = store.n_iterations();
        let ctx = StageContext {
            store,
            pool: &pool,
            scheme: scheme.name(),
            n_iterations,
        };
        let mut regenerated = Vec::new();

        let assign_plan = scheme.assign();
        let assign_hash =
            ArgHash::for_assign(&assign_plan.tokens, n_iterations, scheme.bins(), scheme.states())?;
        let assign = self.refresh(
            scheme,
            DatasetName::Assign,
            &assign_hash,
            false,
            &mut regenerated,
            |path| self.stages.assign(&ctx, &assign_plan.config, path),
            AssignDataset::from_file,
        )?;
        let upstream = !regenerated.is_empty();

        let direct_plan = scheme.direct();
        let direct_hash = ArgHash::for_kinetics(
            DatasetName::Direct,
            &direct_plan.tokens,
            n_iterations,
            &assign.arg_hash,
        )?;
        let direct = self.refresh(
            scheme,
            DatasetName::Direct,
            &direct_hash,
            upstream,
            &mut regenerated,
            |path| self.stages.direct(&ctx, &assign.data, &direct_plan.config, path),
            KineticsDataset::from_file,
        )?;

        let reweight = if scheme.postanalysis() {
            let plan = scheme.reweight();
            let hash = ArgHash::for_kinetics(
                DatasetName::Reweight,
                &plan.tokens,
                n_iterations,
                &assign.arg_hash,
            )?;
            Some(self.refresh(
                scheme,
                DatasetName::Reweight,
                &hash,
                upstream,
                &mut regenerated,
                |path| self.stages.reweight(&ctx, &assign.data, &plan.config, path),
                KineticsDataset::from_file,
            )?)
        } else {
            debug!(scheme = scheme.name(), "post-analysis disabled, skipping reweight");
            None
        };

        drop(pool);
        info!(
            scheme = scheme.name(),
            n_iterations,
            regenerated = ?regenerated,
            elapsed_ms = started.elapsed().as_millis(),
            "scheme datasets are current"
        );

        Ok(SchemeDatasets {
            scheme: scheme.name().to_string(),
            n_iterations,
            assign,
            direct,
            reweight,
            regenerated,
        })
    }

    fn staleness(&self, path: &Path, expected: &ArgHash, upstream: bool) -> Staleness {
        if self.options.reanalyze {
            return Staleness::Forced;
        }
        if upstream {
            return Staleness::UpstreamRegenerated;
        }
        if !path.exists() {
            return Staleness::Missing;
        }
        match storage::read_arg_hash(path) {
            Err(e) => Staleness::Unreadable(e.to_string()),
            Ok(None) => Staleness::Unstamped,
            Ok(Some(stored)) if expected.matches(&stored) => Staleness::Current,
            Ok(Some(_)) => Staleness::HashMismatch,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn refresh<T>(
        &self,
        scheme: &AnalysisScheme,
        name: DatasetName,
        expected: &ArgHash,
        upstream: bool,
        regenerated: &mut Vec<DatasetName>,
        generate: impl FnOnce(&Path) -> Result<()>,
        decode: impl Fn(&DerivedFile) -> Result<T>,
    ) -> Result<CacheEntry<T>> {
        let path = scheme.directory().join(name.file_name());
        let mut reason = self.staleness(&path, expected, upstream);

        if reason.is_current() {
            // A matching stamp on a file that no longer decodes is stale too
            match DerivedFile::open(&path).and_then(|file| {
                let data = decode(&file)?;
                Ok(entry(name, &file, data))
            }) {
                Ok(entry) => {
                    debug!(scheme = scheme.name(), dataset = %name, "reusing cached dataset");
                    return Ok(entry);
                }
                Err(e) => reason = Staleness::Unreadable(e.to_string()),
            }
        }

        info!(
            scheme = scheme.name(),
            dataset = %name,
            reason = %reason,
            "regenerating dataset"
        );
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| Error::stage(name, e.into()))?;
        }

        let started = Instant::now();
        generate(&path).map_err(|e| Error::stage(name, e))?;
        let file = storage::stamp_hash(&path, &expected.to_hex()).map_err(|e| Error::stage(name, e))?;
        let data = decode(&file).map_err(|e| Error::stage(name, e))?;
        regenerated.push(name);

        debug!(
            scheme = scheme.name(),
            dataset = %name,
            arg_hash = %expected,
            elapsed_ms = started.elapsed().as_millis(),
            "dataset stamped"
        );
        Ok(entry(name, &file, data))
    }
}

fn entry<T>(name: DatasetName, file: &DerivedFile, data: T) -> CacheEntry<T> {
    CacheEntry {
        name,
        path: file.path().to_path_buf(),
        arg_hash: file.arg_hash().unwrap_or_default().to_string(),
        generated_at: file.attribute(GENERATED_AT_KEY).map(str::to_string),
        data,
    }
}
