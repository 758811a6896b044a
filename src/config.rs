//! Analysis settings
//!
//! Settings are read from a JSON document mirroring the `analysis` section of
//! a weighted ensemble configuration. Stage options are layered (analysis
//! defaults, then per-stage, then per-scheme) and flattened into a canonical
//! token list that feeds the cache key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::binning::{BinMapperDef, StateDef};
use crate::cache::DatasetName;
use crate::{Error, Result};

/// Free-form options for one sub-pipeline stage.
///
/// Keys are option names (`step_iter`, `evolution`, ...). The special key
/// `extra` holds a list of bare flags.
pub type StageOptions = BTreeMap<String, Value>;

/// Key holding bare boolean-style flags inside [`StageOptions`].
pub const EXTRA_KEY: &str = "extra";

fn default_directory() -> PathBuf {
    PathBuf::from("ANALYSIS")
}

/// Top-level analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSettings {
    /// Root directory for per-scheme derived datasets
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Analysis-wide post-analysis (reweighting) default
    #[serde(default)]
    pub postanalysis: Option<bool>,
    /// Worker threads for stage execution (0 = rayon default)
    #[serde(default)]
    pub workers: usize,
    /// Assignment options shared by every scheme
    #[serde(default)]
    pub w_assign: StageOptions,
    /// Options shared by both kinetics stages
    #[serde(default)]
    pub kinetics: StageOptions,
    /// Direct kinetics options
    #[serde(default)]
    pub w_direct: StageOptions,
    /// Reweighting kinetics options
    #[serde(default)]
    pub w_reweight: StageOptions,
    /// Schemes in declaration order
    pub analysis_schemes: Vec<SchemeSettings>,
}

/// Settings for one named analysis scheme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemeSettings {
    /// Scheme name, also the name of its derived-data directory
    pub name: String,
    /// Missing means enabled
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Overrides the analysis-wide post-analysis default
    #[serde(default)]
    pub postanalysis: Option<bool>,
    /// Bin mapping used for assignment
    pub bins: BinMapperDef,
    /// State definitions
    #[serde(default)]
    pub states: Vec<StateDef>,
    /// Per-scheme assignment overrides
    #[serde(default)]
    pub w_assign: StageOptions,
    /// Per-scheme overrides for both kinetics stages
    #[serde(default)]
    pub kinetics: StageOptions,
    /// Per-scheme direct kinetics overrides
    #[serde(default)]
    pub w_direct: StageOptions,
    /// Per-scheme reweighting overrides
    #[serde(default)]
    pub w_reweight: StageOptions,
}

impl SchemeSettings {
    /// Whether the scheme takes part in analysis.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

impl AnalysisSettings {
    /// Parse and validate settings from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the settings are inconsistent
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Check scheme names, bin mappers and `extra` lists.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.analysis_schemes.is_empty() {
            return Err(Error::Config("no analysis schemes defined".to_string()));
        }

        let mut seen = std::collections::BTreeSet::new();
        for scheme in &self.analysis_schemes {
            if scheme.name.is_empty() {
                return Err(Error::Config("scheme name cannot be empty".to_string()));
            }
            if !seen.insert(scheme.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate scheme name '{}'",
                    scheme.name
                )));
            }
            scheme.bins.build()?;
        }

        let scheme_layers = self.analysis_schemes.iter().flat_map(|s| {
            [&s.w_assign, &s.kinetics, &s.w_direct, &s.w_reweight]
        });
        for options in [&self.w_assign, &self.kinetics, &self.w_direct, &self.w_reweight]
            .into_iter()
            .chain(scheme_layers)
        {
            extra_flags(options)?;
        }
        Ok(())
    }

    /// Post-analysis flag for a scheme: scheme value, then analysis default, then off.
    #[must_use]
    pub fn postanalysis_for(&self, scheme: &SchemeSettings) -> bool {
        scheme.postanalysis.or(self.postanalysis).unwrap_or(false)
    }

    /// Merged assignment options for a scheme.
    #[must_use]
    pub fn assign_options(&self, scheme: &SchemeSettings) -> StageOptions {
        layered(&[&self.w_assign, &scheme.w_assign])
    }

    /// Merged options for one kinetics stage of a scheme.
    ///
    /// Order: analysis `kinetics`, analysis `w_<stage>`, scheme `kinetics`,
    /// scheme `w_<stage>`.
    #[must_use]
    pub fn kinetics_options(&self, scheme: &SchemeSettings, dataset: DatasetName) -> StageOptions {
        let (global, local) = match dataset {
            DatasetName::Reweight => (&self.w_reweight, &scheme.w_reweight),
            DatasetName::Assign | DatasetName::Direct => (&self.w_direct, &scheme.w_direct),
        };
        layered(&[&self.kinetics, global, &scheme.kinetics, local])
    }
}

/// Merge option layers; later layers win key by key.
#[must_use]
pub fn layered(layers: &[&StageOptions]) -> StageOptions {
    let mut merged = StageOptions::new();
    for layer in layers {
        for (key, value) in *layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Bare flags listed under `extra`.
///
/// # Errors
///
/// Returns `Error::Config` if `extra` is not a list of strings
pub fn extra_flags(options: &StageOptions) -> Result<Vec<String>> {
    match options.get(EXTRA_KEY) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    Error::Config(format!("'extra' entries must be strings, got {item}"))
                })
            })
            .collect(),
        Some(other) => Err(Error::Config(format!(
            "'extra' must be a list of flags, got {other}"
        ))),
    }
}

fn option_token(key: &str) -> String {
    format!("--{}", key.replace('_', "-"))
}

fn value_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten options into `--key value` tokens followed by `--flag` tokens.
///
/// Keys come out in sorted order so the token list is canonical.
///
/// # Errors
///
/// Returns `Error::Config` if `extra` is malformed
pub fn flatten_tokens(options: &StageOptions) -> Result<Vec<String>> {
    let mut tokens = Vec::with_capacity(options.len() * 2);
    for (key, value) in options {
        if key == EXTRA_KEY {
            continue;
        }
        tokens.push(option_token(key));
        tokens.push(value_token(value));
    }
    for flag in extra_flags(options)? {
        tokens.push(option_token(&flag));
    }
    Ok(tokens)
}
