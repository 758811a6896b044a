//! Cache keys
//!
//! A key is a BLAKE3 digest over a versioned canonical JSON document holding
//! exactly the inputs that decide a dataset's content: the flattened stage
//! tokens, the iteration count in scope and, for `assign`, the bin mapper and
//! state definitions. Kinetics keys also carry the `arg_hash` stamped on the
//! `assign` file they were computed from. Bump [`CACHE_KEY_VERSION`] whenever that document or a
//! stage's output layout changes so old files are regenerated.

use std::fmt;

use serde::Serialize;

use super::DatasetName;
use crate::binning::{BinMapperDef, StateDef};
use crate::Result;

/// Version of the canonical key document.
pub const CACHE_KEY_VERSION: u32 = 2;

#[derive(Serialize)]
struct AssignKey<'a> {
    version: u32,
    dataset: DatasetName,
    tokens: &'a [String],
    n_iterations: u32,
    bins: &'a BinMapperDef,
    states: &'a [StateDef],
}

#[derive(Serialize)]
struct KineticsKey<'a> {
    version: u32,
    dataset: DatasetName,
    tokens: &'a [String],
    n_iterations: u32,
    upstream: &'a str,
}

/// Content hash stamped into a derived dataset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ArgHash(blake3::Hash);

impl ArgHash {
    fn digest<T: Serialize>(key: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(key)?;
        Ok(Self(blake3::hash(&bytes)))
    }

    /// Key for the assignment dataset.
    ///
    /// # Errors
    ///
    /// Returns error if the key document cannot be serialized
    pub fn for_assign(
        tokens: &[String],
        n_iterations: u32,
        bins: &BinMapperDef,
        states: &[StateDef],
    ) -> Result<Self> {
        Self::digest(&AssignKey {
            version: CACHE_KEY_VERSION,
            dataset: DatasetName::Assign,
            tokens,
            n_iterations,
            bins,
            states,
        })
    }

    /// Key for a kinetics dataset (`direct` or `reweight`) computed from the
    /// `assign` file stamped with `upstream`.
    ///
    /// # Errors
    ///
    /// Returns error if the key document cannot be serialized
    pub fn for_kinetics(
        dataset: DatasetName,
        tokens: &[String],
        n_iterations: u32,
        upstream: &str,
    ) -> Result<Self> {
        Self::digest(&KineticsKey {
            version: CACHE_KEY_VERSION,
            dataset,
            tokens,
            n_iterations,
            upstream,
        })
    }

    /// Lowercase hex form, as stored in the `arg_hash` attribute.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Whether a stored attribute value matches this hash.
    #[must_use]
    pub fn matches(&self, stored: &str) -> bool {
        self.to_hex() == stored
    }
}

impl fmt::Display for ArgHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bins() -> BinMapperDef {
        BinMapperDef::RectilinearBinMapper {
            boundaries: vec![vec![0.0, 2.8, 7.0, 10000.0]],
        }
    }

    fn states() -> Vec<StateDef> {
        vec![StateDef {
            label: "bound".to_string(),
            coords: vec![vec![2.7]],
        }]
    }

    fn tokens() -> Vec<String> {
        vec!["--step-iter".to_string(), "1".to_string()]
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = ArgHash::for_assign(&tokens(), 10, &bins(), &states()).unwrap();
        let b = ArgHash::for_assign(&tokens(), 10, &bins(), &states()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
        assert!(a.matches(&b.to_hex()));
    }

    #[test]
    fn test_iteration_count_changes_hash() {
        let a = ArgHash::for_kinetics(DatasetName::Direct, &tokens(), 10, "a1").unwrap();
        let b = ArgHash::for_kinetics(DatasetName::Direct, &tokens(), 11, "a1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_states_and_bins_change_hash() {
        let base = ArgHash::for_assign(&tokens(), 10, &bins(), &states()).unwrap();

        let mut moved = states();
        moved[0].coords = vec![vec![1.0]];
        assert_ne!(base, ArgHash::for_assign(&tokens(), 10, &bins(), &moved).unwrap());

        let other_bins = BinMapperDef::RectilinearBinMapper {
            boundaries: vec![vec![0.0, 3.0, 10000.0]],
        };
        assert_ne!(base, ArgHash::for_assign(&tokens(), 10, &other_bins, &states()).unwrap());
    }

    #[test]
    fn test_dataset_name_separates_kinetics_keys() {
        let direct = ArgHash::for_kinetics(DatasetName::Direct, &tokens(), 10, "a1").unwrap();
        let reweight = ArgHash::for_kinetics(DatasetName::Reweight, &tokens(), 10, "a1").unwrap();
        assert_ne!(direct, reweight);
    }

    #[test]
    fn test_upstream_stamp_changes_kinetics_hash() {
        let a = ArgHash::for_kinetics(DatasetName::Reweight, &tokens(), 10, "a1").unwrap();
        let b = ArgHash::for_kinetics(DatasetName::Reweight, &tokens(), 10, "b2").unwrap();
        assert_ne!(a, b);
    }
}
