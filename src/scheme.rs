//! Scheme Registry - named analysis configurations
//!
//! Each scheme owns a derived-data directory (`<analysis dir>/<name>`) and
//! the merged, typed configuration of its three stages.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::binning::{BinMapperDef, StateDef};
use crate::cache::DatasetName;
use crate::config::{flatten_tokens, AnalysisSettings, SchemeSettings, StageOptions};
use crate::stages::{AssignConfig, KineticsConfig};
use crate::{Error, Result};

/// Merged options of one stage: canonical tokens plus the typed form.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan<C> {
    /// Merged option mapping
    pub options: StageOptions,
    /// Canonical `--key value` tokens (feed the cache key)
    pub tokens: Vec<String>,
    /// Typed configuration handed to the stage
    pub config: C,
}

/// One named analysis configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisScheme {
    name: String,
    directory: PathBuf,
    enabled: bool,
    postanalysis: bool,
    bins: BinMapperDef,
    states: Vec<StateDef>,
    assign: StagePlan<AssignConfig>,
    direct: StagePlan<KineticsConfig>,
    reweight: StagePlan<KineticsConfig>,
}

impl AnalysisScheme {
    /// Resolve a scheme's layered options against the analysis settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any stage configuration is invalid
    pub fn from_settings(settings: &AnalysisSettings, scheme: &SchemeSettings) -> Result<Self> {
        let assign_options = settings.assign_options(scheme);
        let assign = StagePlan {
            tokens: flatten_tokens(&assign_options)?,
            config: AssignConfig::from_options(&assign_options, &scheme.bins, &scheme.states)?,
            options: assign_options,
        };

        let kinetics = |dataset: DatasetName| -> Result<StagePlan<KineticsConfig>> {
            let options = settings.kinetics_options(scheme, dataset);
            Ok(StagePlan {
                tokens: flatten_tokens(&options)?,
                config: KineticsConfig::from_options(&options)?,
                options,
            })
        };

        Ok(Self {
            name: scheme.name.clone(),
            directory: settings.directory.join(&scheme.name),
            enabled: scheme.is_enabled(),
            postanalysis: settings.postanalysis_for(scheme),
            bins: scheme.bins.clone(),
            states: scheme.states.clone(),
            assign,
            direct: kinetics(DatasetName::Direct)?,
            reweight: kinetics(DatasetName::Reweight)?,
        })
    }

    /// Scheme name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the scheme's derived datasets.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Re-root the derived-data directory (the scheme name stays the leaf).
    #[must_use]
    pub fn with_root(mut self, root: &Path) -> Self {
        self.directory = root.join(&self.name);
        self
    }

    /// Whether the scheme takes part in analysis.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the `reweight` dataset is produced.
    #[must_use]
    pub const fn postanalysis(&self) -> bool {
        self.postanalysis
    }

    /// Bin mapper definition.
    #[must_use]
    pub const fn bins(&self) -> &BinMapperDef {
        &self.bins
    }

    /// State definitions.
    #[must_use]
    pub fn states(&self) -> &[StateDef] {
        &self.states
    }

    /// Assignment stage plan.
    #[must_use]
    pub const fn assign(&self) -> &StagePlan<AssignConfig> {
        &self.assign
    }

    /// Direct kinetics stage plan.
    #[must_use]
    pub const fn direct(&self) -> &StagePlan<KineticsConfig> {
        &self.direct
    }

    /// Reweighting kinetics stage plan.
    #[must_use]
    pub const fn reweight(&self) -> &StagePlan<KineticsConfig> {
        &self.reweight
    }
}

/// How a caller names a scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeSelector {
    /// By scheme name
    Name(String),
    /// By position in declaration order
    Index(usize),
}

impl From<&str> for SchemeSelector {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for SchemeSelector {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<usize> for SchemeSelector {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for SchemeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// Registry of analysis schemes with one active scheme.
///
/// ## Design
///
/// Schemes keep their declaration order so index selection is stable.
/// The active scheme is always an enabled one.
#[derive(Debug, Clone)]
pub struct SchemeRegistry {
    schemes: Vec<AnalysisScheme>,
    active: usize,
}

impl SchemeRegistry {
    /// Build every scheme; the first enabled one becomes active.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a scheme is invalid or none is enabled
    pub fn from_settings(settings: &AnalysisSettings) -> Result<Self> {
        let schemes = settings
            .analysis_schemes
            .iter()
            .map(|s| AnalysisScheme::from_settings(settings, s))
            .collect::<Result<Vec<_>>>()?;
        Self::new(schemes)
    }

    /// Registry over already-built schemes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no scheme is enabled
    pub fn new(schemes: Vec<AnalysisScheme>) -> Result<Self> {
        let active = schemes
            .iter()
            .position(AnalysisScheme::is_enabled)
            .ok_or_else(|| Error::Config("no enabled analysis scheme".to_string()))?;
        Ok(Self { schemes, active })
    }

    /// Every scheme, in declaration order.
    #[must_use]
    pub fn list(&self) -> &[AnalysisScheme] {
        &self.schemes
    }

    /// Enabled schemes, in declaration order.
    pub fn enabled(&self) -> impl Iterator<Item = &AnalysisScheme> {
        self.schemes.iter().filter(|s| s.is_enabled())
    }

    /// Number of schemes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemes.len()
    }

    /// Whether the registry holds no schemes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }

    /// Look up a scheme by name or index.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemeNotFound` for an unknown name or index
    pub fn get(&self, selector: impl Into<SchemeSelector>) -> Result<&AnalysisScheme> {
        let index = self.position(&selector.into())?;
        Ok(&self.schemes[index])
    }

    /// The active scheme.
    #[must_use]
    pub fn active(&self) -> &AnalysisScheme {
        &self.schemes[self.active]
    }

    /// Make another scheme active.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemeNotFound` for an unknown scheme and
    /// `Error::SchemeDisabled` for a disabled one; the active scheme is
    /// unchanged in both cases
    pub fn set_active(&mut self, selector: impl Into<SchemeSelector>) -> Result<&AnalysisScheme> {
        let index = self.position(&selector.into())?;
        let scheme = &self.schemes[index];
        if !scheme.is_enabled() {
            return Err(Error::SchemeDisabled(scheme.name.clone()));
        }
        self.active = index;
        Ok(&self.schemes[index])
    }

    fn position(&self, selector: &SchemeSelector) -> Result<usize> {
        match selector {
            SchemeSelector::Index(i) if *i < self.schemes.len() => Ok(*i),
            SchemeSelector::Name(name) => self
                .schemes
                .iter()
                .position(|s| s.name == *name)
                .ok_or_else(|| Error::SchemeNotFound(name.clone())),
            SchemeSelector::Index(_) => Err(Error::SchemeNotFound(selector.to_string())),
        }
    }
}
