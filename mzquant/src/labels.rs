//! Metabolic and fixed isotope labels.
//!
//! Metabolic labels enrich an element pool of the whole sample, e.g. `15N` at 0.99,
//! and every formula gets one pattern per combination of enrichment levels. Fixed
//! labels replace amino acids by labeled variants (SILAC), which turns one peptide
//! into several molecules.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::MZQuantError;
use crate::knowledge_base::split_isotope_key;
use crate::params::format_percentile;

/// Isotope key, e.g. `15N`, mapped to the enrichment levels to build patterns for
pub type MetabolicLabels = BTreeMap<String, Vec<f64>>;

/// Amino acid mapped to its label definitions. A definition is a modification
/// name or a unimod style composition delta, an empty string is the unlabeled state.
pub type FixedLabels = BTreeMap<String, Vec<String>>;

pub fn default_metabolic_labels() -> MetabolicLabels {
    let mut labels = MetabolicLabels::new();
    labels.insert("15N".to_string(), vec![0.0]);
    labels
}

/// The enrichment level of each metabolically labeled element a pattern was built
/// for, as `(element, formatted level)` pairs sorted by element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelPercentiles(Vec<(String, String)>);

impl LabelPercentiles {
    pub fn new(mut pairs: Vec<(String, String)>) -> Self {
        pairs.sort();
        Self(pairs)
    }

    pub fn get(&self, element: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(e, _)| e == element)
            .map(|(_, p)| p.as_str())
    }

    pub fn contains(&self, element: &str, percentile: &str) -> bool {
        self.get(element) == Some(percentile)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(e, p)| (e.as_str(), p.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for LabelPercentiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = self.0.iter().map(|(e, p)| format!("{e}:{p}")).join(",");
        f.write_str(&text)
    }
}

impl FromStr for LabelPercentiles {
    type Err = MZQuantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pairs = Vec::new();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (element, percentile) = token
                .split_once(':')
                .ok_or_else(|| MZQuantError::MalformedFormula(s.to_string()))?;
            pairs.push((element.trim().to_string(), percentile.trim().to_string()));
        }
        Ok(Self::new(pairs))
    }
}

impl<S: Into<String>, T: Into<String>> FromIterator<(S, T)> for LabelPercentiles {
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(e, p)| (e.into(), p.into())).collect())
    }
}

/// Split a metabolic label key like `15N` into its mass number and element
pub fn parse_isotope_label(key: &str) -> Result<(u32, &str), MZQuantError> {
    match split_isotope_key(key) {
        (Some(mass_number), element) if !element.is_empty() => Ok((mass_number, element)),
        _ => Err(MZQuantError::MalformedFormula(key.to_string())),
    }
}

/// Every combination of metabolic enrichment levels, one [`LabelPercentiles`] each
pub fn label_percentile_tuples(
    labels: &MetabolicLabels,
) -> Result<Vec<LabelPercentiles>, MZQuantError> {
    let mut axes = Vec::with_capacity(labels.len());
    for (key, percentiles) in labels.iter() {
        let (_, element) = parse_isotope_label(key)?;
        axes.push(
            percentiles
                .iter()
                .map(|p| (element.to_string(), format_percentile(*p)))
                .collect_vec(),
        );
    }
    if axes.is_empty() {
        return Ok(Vec::new());
    }
    let tuples = axes
        .into_iter()
        .multi_cartesian_product()
        .map(|combination| {
            // A later label on the same element takes precedence
            let merged: BTreeMap<String, String> = combination.into_iter().collect();
            LabelPercentiles(merged.into_iter().collect())
        })
        .collect();
    Ok(tuples)
}

/// Check the SILAC lock list against the fixed labels
pub fn validate_locked_amino_acids(
    locked: &[String],
    fixed_labels: &FixedLabels,
) -> Result<(), MZQuantError> {
    if locked.len() == 1 {
        return Err(MZQuantError::LockedAminoAcidsTooFew(locked.to_vec()));
    }
    let counts: BTreeSet<usize> = locked
        .iter()
        .map(|aa| fixed_labels.get(aa).map(|v| v.len()).unwrap_or_default())
        .collect();
    if counts.len() > 1 {
        return Err(MZQuantError::LockedLabelCountMismatch(locked.to_vec()));
    }
    Ok(())
}

/// Expand `molecule` into every fixed label variant, e.g. `KLEINER` with two labels
/// on `R` becomes `KLEINER0` and `KLEINER1`.
///
/// The residue part of the molecule ends at the first character which is not a
/// known single letter residue, anything after it is carried along unchanged. When
/// `locked` amino acids are given, only variants where all of them carry the same
/// label index are kept.
///
/// Returns `None` if no residue of the molecule carries a fixed label.
pub fn expand_fixed_labels<F: Fn(&str) -> bool>(
    molecule: &str,
    fixed_labels: &FixedLabels,
    is_residue: F,
    locked: Option<&[String]>,
) -> Option<BTreeSet<String>> {
    let split = molecule
        .char_indices()
        .find(|(i, c)| !is_residue(&molecule[*i..*i + c.len_utf8()]))
        .map(|(i, _)| i)
        .unwrap_or(molecule.len());
    let (sequence, addon) = molecule.split_at(split);

    let sites: Vec<(usize, char, usize)> = sequence
        .char_indices()
        .filter_map(|(i, c)| {
            let mut buf = [0u8; 4];
            fixed_labels
                .get(&*c.encode_utf8(&mut buf))
                .map(|labels| (i, c, labels.len()))
        })
        .collect();
    if sites.is_empty() {
        return None;
    }

    let is_locked = |c: char| {
        locked
            .map(|aas| aas.iter().any(|aa| aa.chars().eq(std::iter::once(c))))
            .unwrap_or(false)
    };

    let mut variants = BTreeSet::new();
    for combination in sites
        .iter()
        .map(|(_, _, n)| 0..*n)
        .multi_cartesian_product()
    {
        let mut states = BTreeSet::new();
        let mut variant = String::with_capacity(sequence.len() * 2 + addon.len());
        let mut sites_iter = sites.iter().zip(combination.iter()).peekable();
        for (i, c) in sequence.char_indices() {
            variant.push(c);
            if let Some(((pos, aa, _), state)) = sites_iter.peek() {
                if *pos == i {
                    variant.push_str(&state.to_string());
                    if is_locked(*aa) {
                        states.insert(**state);
                    }
                    sites_iter.next();
                }
            }
        }
        if locked.is_some() && states.len() > 1 {
            continue;
        }
        variant.push_str(addon);
        variants.insert(variant);
    }
    Some(variants)
}
