//! # ensemble-ipa: Weighted Ensemble Analysis Core
//!
//! Cached analysis of weighted ensemble simulations: every iteration holds a
//! population of weighted walkers, each pointing at its parent in the
//! previous iteration. This crate keeps per-scheme derived datasets
//! (`assign`, `direct`, `reweight`) current and reconstructs walker
//! ancestry and descendants on demand.
//!
//! ## Components
//!
//! - [`store`]: read-only iteration records (in-memory or Parquet)
//! - [`scheme`]: named analysis configurations
//! - [`cache`]: hash-stamped derived datasets, regenerated when stale
//! - [`view`]: one iteration joined with its scheme's labels and kinetics
//! - [`lineage`]: backward traces and forward children
//! - [`context`]: current iteration/scheme as an explicit value
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ensemble_ipa::cache::{CacheOptions, PipelineCache};
//! use ensemble_ipa::config::AnalysisSettings;
//! use ensemble_ipa::context::AnalysisContext;
//! use ensemble_ipa::store::ParquetIterationStore;
//!
//! let settings = AnalysisSettings::from_path("analysis.json")?;
//! let store = Arc::new(ParquetIterationStore::open("traj_segs")?);
//! let cache = PipelineCache::new(CacheOptions::default());
//!
//! let mut ctx = AnalysisContext::open(store, &settings, &cache)?;
//! ctx.set_iteration(10);
//! let heaviest = ctx.current()?.max_weight();
//! if let Some(walker) = heaviest {
//!     let lineage = ctx.trace(walker.seg_id)?;
//!     println!("states: {:?}", lineage.walkers().iter().map(|w| w.final_state()).collect::<Vec<_>>());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod binning;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod lineage;
pub mod scheme;
pub mod stages;
pub mod storage;
pub mod store;
pub mod view;

pub use error::{Error, Result};
