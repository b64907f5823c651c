//! Theoretical isotope patterns for every molecule, label combination and charge.
//!
//! An [`IsotopologueLibrary`] is built once with an [`IsotopologueLibraryBuilder`]
//! and is immutable afterwards. It holds one [`Isotopologue`] per formula and
//! [`LabelPercentiles`] combination, and sorts all of their charge states by m/z
//! into [`MatchSet`]s so spectra can be matched in bins.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;

use identity_hash::BuildIdentityHasher;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::composition::{ChemicalKnowledge, Composition};
use crate::element_tree::{recalculate_distribution, ElementEnvelope, ElementTree};
use crate::error::MZQuantError;
use crate::evidence::{format_fixed_labels, EvidenceLookup, FixedModification, MoleculeEvidence};
use crate::knowledge_base::{
    element_symbols, most_abundant, natural_isotopes, split_isotope_key, Isotope, PROTON,
};
use crate::labels::{
    default_metabolic_labels, expand_fixed_labels, label_percentile_tuples, parse_isotope_label,
    validate_locked_amino_acids, FixedLabels, LabelPercentiles, MetabolicLabels,
};
use crate::params::{format_percentile, Params};

/// A set of transformed m/z values
pub type TmzSet = HashSet<i64, BuildIdentityHasher<i64>>;

/// The percentile key of natural, unenriched distributions
pub const NATURAL_PERCENTILE: &str = "0.000";

type Distributions = BTreeMap<String, BTreeMap<String, Vec<Isotope>>>;
type ElementTrees = BTreeMap<String, BTreeMap<String, ElementTree>>;

/// An inclusive range of transformed m/z values around one theoretical peak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmzRange {
    pub start: i64,
    pub end: i64,
}

impl TmzRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, tmz: i64) -> bool {
        self.start <= tmz && tmz <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// One isotope position of a theoretical pattern
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TheoreticalPeak {
    pub position: usize,
    pub mass: f64,
    /// The summed abundance scaled by `INTENSITY_TRANSFORMATION_FACTOR`
    pub abundance: i64,
    pub relative_abundance: f64,
    /// Whether the peak is intense enough to be used for matching
    pub is_c_peak: bool,
}

/// The m/z values of an [`Isotopologue`] at one charge
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeState {
    pub charge: i32,
    pub mz: Vec<f64>,
    /// One entry per peak, `None` for peaks which are not c-peaks
    pub tmzs: Vec<Option<TmzRange>>,
    pub atmzs: TmzSet,
}

/// The theoretical isotope pattern of one formula at one set of enrichment levels
#[derive(Debug, Clone, PartialEq)]
pub struct Isotopologue {
    pub formula: String,
    pub label_percentiles: LabelPercentiles,
    pub peaks: Vec<TheoreticalPeak>,
    pub charge_states: Vec<ChargeState>,
}

impl Isotopologue {
    pub fn n_c_peaks(&self) -> usize {
        self.peaks.iter().filter(|p| p.is_c_peak).count()
    }

    pub fn charge_state(&self, charge: i32) -> Option<&ChargeState> {
        self.charge_states.iter().find(|c| c.charge == charge)
    }
}

/// One charge state of one pattern, positioned by its m/z span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEntry {
    pub lower_mz: f64,
    pub upper_mz: f64,
    pub charge: i32,
    pub label_percentiles: LabelPercentiles,
    pub formula: String,
}

/// A bin of consecutive [`MatchEntry`] values matched against a spectrum together
#[derive(Debug, Clone)]
pub struct MatchSet {
    pub start: usize,
    pub end: usize,
    pub tmzs: TmzSet,
    pub mz_range: (f64, f64),
}

impl MatchSet {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Name and identification lookups connecting input molecules to formulas
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    pub molecule_to_formula: BTreeMap<String, String>,
    pub formula_to_molecules: BTreeMap<String, BTreeSet<String>>,
    pub formula_to_trivial_names: BTreeMap<String, BTreeSet<String>>,
    /// Input molecules mapped to their fixed label variants
    pub molecule_fixed_label_variations: BTreeMap<String, BTreeSet<String>>,
    pub formula_to_evidences: BTreeMap<String, BTreeMap<String, MoleculeEvidence>>,
}

impl Lookup {
    /// Resolve a molecule or a formula to a formula
    pub fn formula_of<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.formula_to_molecules.contains_key(name) {
            Some(name)
        } else {
            self.molecule_to_formula.get(name).map(|s| s.as_str())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IsotopologueLibraryBuilder {
    molecules: Vec<String>,
    charges: Vec<i32>,
    metabolic_labels: MetabolicLabels,
    fixed_labels: FixedLabels,
    trivial_names: BTreeMap<String, String>,
    evidences: EvidenceLookup,
    params: Params,
}

impl IsotopologueLibraryBuilder {
    pub fn new() -> Self {
        Self {
            charges: vec![2],
            ..Default::default()
        }
    }

    pub fn molecules<I: IntoIterator<Item = S>, S: Into<String>>(mut self, molecules: I) -> Self {
        self.molecules.extend(molecules.into_iter().map(|m| m.into()));
        self
    }

    pub fn charges<I: IntoIterator<Item = i32>>(mut self, charges: I) -> Self {
        self.charges = charges.into_iter().collect();
        self
    }

    pub fn metabolic_labels(mut self, labels: MetabolicLabels) -> Self {
        self.metabolic_labels = labels;
        self
    }

    pub fn fixed_labels(mut self, labels: FixedLabels) -> Self {
        self.fixed_labels = labels;
        self
    }

    /// Display names of molecules, collected per formula
    pub fn trivial_names(mut self, names: BTreeMap<String, String>) -> Self {
        self.trivial_names = names;
        self
    }

    /// Identification evidence keyed by molecule. Every molecule with evidence is
    /// added to the library.
    pub fn evidences(mut self, evidences: EvidenceLookup) -> Self {
        self.evidences = evidences;
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn build(self) -> Result<IsotopologueLibrary, MZQuantError> {
        let Self {
            molecules,
            charges,
            metabolic_labels,
            fixed_labels,
            trivial_names,
            evidences,
            mut params,
        } = self;
        let metabolic_labels = if metabolic_labels.is_empty() {
            default_metabolic_labels()
        } else {
            metabolic_labels
        };

        let mut knowledge = ChemicalKnowledge::from_params(&params)?;
        let (mut distributions, labeled_elements) = metabolic_distributions(&metabolic_labels)?;
        let label_tuples = label_percentile_tuples(&metabolic_labels)?;
        debug!(
            "Building patterns for {} label combinations of {:?}",
            label_tuples.len(),
            labeled_elements
        );

        let (fixed_labels, molecules, evidences) = if fixed_labels.is_empty() {
            (fixed_labels, molecules, evidences)
        } else {
            let fixed_modifications: Vec<FixedModification> = fixed_labels
                .iter()
                .flat_map(|(aa, definitions)| {
                    definitions
                        .iter()
                        .map(|d| FixedModification::from_definition(&knowledge, aa, d))
                })
                .collect();
            let formatted = format_fixed_labels(&fixed_modifications, &molecules, evidences);
            (formatted.fixed_labels, formatted.molecules, formatted.evidences)
        };

        let mut fixed_label_levels = params.fixed_label_isotope_enrichment_levels.clone();
        let mut lookup = Lookup::default();

        let mut all_molecules: Vec<String> = Vec::with_capacity(molecules.len() + evidences.len());
        let mut seen = BTreeSet::new();
        for molecule in molecules.into_iter().chain(evidences.keys().cloned()) {
            if seen.insert(molecule.clone()) {
                all_molecules.push(molecule);
            }
        }

        let mut variant_origin: BTreeMap<String, String> = BTreeMap::new();
        let molecules = if fixed_labels.is_empty() {
            all_molecules
        } else {
            let locked = params.silac_aas_locked_in_experiment.as_deref();
            if let Some(locked) = locked {
                validate_locked_amino_acids(locked, &fixed_labels)?;
            }
            register_fixed_label_residues(
                &mut knowledge,
                &mut distributions,
                &mut fixed_label_levels,
                &fixed_labels,
            )?;
            let mut expanded = Vec::new();
            for molecule in all_molecules {
                match expand_fixed_labels(
                    &molecule,
                    &fixed_labels,
                    |aa| knowledge.has_amino_acid(aa),
                    locked,
                ) {
                    Some(variants) => {
                        for variant in variants.iter() {
                            variant_origin.insert(variant.clone(), molecule.clone());
                            expanded.push(variant.clone());
                        }
                        lookup
                            .molecule_fixed_label_variations
                            .insert(molecule, variants);
                    }
                    None => expanded.push(molecule),
                }
            }
            expanded
        };

        let mut compositions: BTreeMap<String, Composition> = BTreeMap::new();
        let mut highest_count: BTreeMap<String, usize> = BTreeMap::new();
        let mut two_isotope_range: Option<(usize, usize)> = None;

        for molecule in molecules {
            let mut composition = knowledge.parse_molecule(&molecule)?;
            composition.retain_nonzero();
            if let Some((element, _)) = composition.iter().find(|(_, count)| *count < 0) {
                return Err(MZQuantError::NegativeElementCount(
                    molecule.clone(),
                    element.to_string(),
                ));
            }
            if composition.is_empty() {
                warn!("Skipping {molecule}, it has an empty composition");
                continue;
            }
            let formula = composition.hill_notation_unimod();
            trace!("{molecule} has formula {formula}");

            let origin = variant_origin.get(&molecule).unwrap_or(&molecule);
            for name in [trivial_names.get(&molecule), trivial_names.get(origin)]
                .into_iter()
                .flatten()
            {
                lookup
                    .formula_to_trivial_names
                    .entry(formula.clone())
                    .or_default()
                    .insert(name.clone());
            }
            if let Some(evidence) = evidences.get(origin) {
                lookup
                    .formula_to_trivial_names
                    .entry(formula.clone())
                    .or_default()
                    .extend(evidence.trivial_names.iter().cloned());
                lookup
                    .formula_to_evidences
                    .entry(formula.clone())
                    .or_default()
                    .insert(origin.clone(), evidence.clone());
            }
            lookup
                .molecule_to_formula
                .insert(molecule.clone(), formula.clone());
            lookup
                .formula_to_molecules
                .entry(formula.clone())
                .or_default()
                .insert(molecule.clone());

            for (key, count) in composition.iter() {
                if !distributions.contains_key(key) {
                    add_isotope_key_distribution(&mut distributions, key, &fixed_label_levels)?;
                }
                let count = count as usize;
                let highest = highest_count.entry(key.to_string()).or_default();
                *highest = (*highest).max(count);
                if has_two_isotopes(key) {
                    two_isotope_range = Some(match two_isotope_range {
                        Some((lo, hi)) => (lo.min(count), hi.max(count)),
                        None => (count, count),
                    });
                }
            }
            compositions.insert(formula, composition);
        }

        // Prefixed atoms may be merged into their template element, whose trees must
        // then reach the combined count
        let prefixed: Vec<(String, usize)> = highest_count
            .iter()
            .filter(|(key, _)| split_isotope_key(key).0.is_some())
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (key, count) in prefixed {
            let (_, template) = split_isotope_key(&key);
            let total = highest_count.entry(template.to_string()).or_default();
            *total += count;
            let total = *total;
            if has_two_isotopes(template) {
                two_isotope_range = two_isotope_range.map(|(lo, hi)| (lo, hi.max(total)));
            }
        }

        let two_isotope_start = two_isotope_range.map(|(lo, _)| lo).unwrap_or(1);
        let trees = build_element_trees(
            &distributions,
            &highest_count,
            two_isotope_start,
            params.element_min_abundance,
        );

        params.fixed_label_isotope_enrichment_levels = fixed_label_levels;
        let mut patterns: BTreeMap<String, BTreeMap<LabelPercentiles, Isotopologue>> =
            BTreeMap::new();
        let mut match_entries = Vec::new();
        for (formula, composition) in compositions.iter() {
            let per_label = patterns.entry(formula.clone()).or_default();
            for label_percentiles in label_tuples.iter() {
                let isotopologue = build_isotopologue(
                    formula,
                    composition,
                    label_percentiles,
                    &labeled_elements,
                    &trees,
                    &charges,
                    &params,
                )?;
                for state in isotopologue.charge_states.iter() {
                    if let (Some(lower_mz), Some(upper_mz)) = (state.mz.first(), state.mz.last()) {
                        if params.lower_mz_limit <= *lower_mz && *upper_mz <= params.upper_mz_limit
                        {
                            match_entries.push(MatchEntry {
                                lower_mz: *lower_mz,
                                upper_mz: *upper_mz,
                                charge: state.charge,
                                label_percentiles: label_percentiles.clone(),
                                formula: formula.clone(),
                            });
                        }
                    }
                }
                per_label.insert(label_percentiles.clone(), isotopologue);
            }
        }

        match_entries.sort_by(|a, b| {
            a.lower_mz
                .total_cmp(&b.lower_mz)
                .then(a.upper_mz.total_cmp(&b.upper_mz))
                .then(a.charge.cmp(&b.charge))
                .then_with(|| a.label_percentiles.cmp(&b.label_percentiles))
                .then_with(|| a.formula.cmp(&b.formula))
        });
        let match_sets = build_match_sets(&match_entries, &patterns, params.max_molecules_per_match_bin);
        let mz_range = match_sets.iter().fold(None, |acc: Option<(f64, f64)>, set| {
            Some(match acc {
                Some((lo, hi)) => (lo.min(set.mz_range.0), hi.max(set.mz_range.1)),
                None => set.mz_range,
            })
        });

        if patterns.is_empty() {
            warn!("The isotopologue library is empty");
        }
        info!(
            "Built {} formulas into {} match entries in {} match sets",
            patterns.len(),
            match_entries.len(),
            match_sets.len()
        );

        Ok(IsotopologueLibrary {
            params,
            charges,
            lookup,
            labeled_elements,
            label_percentiles: label_tuples,
            patterns,
            match_entries,
            match_sets,
            mz_range,
        })
    }
}

/// Natural distributions for every known element plus the enriched distributions of
/// the metabolic labels, and the set of metabolically labeled elements
fn metabolic_distributions(
    labels: &MetabolicLabels,
) -> Result<(Distributions, BTreeSet<String>), MZQuantError> {
    let mut distributions = Distributions::new();
    for symbol in element_symbols() {
        if let Some(isotopes) = natural_isotopes(symbol) {
            distributions
                .entry(symbol.to_string())
                .or_default()
                .insert(NATURAL_PERCENTILE.to_string(), isotopes);
        }
    }

    let mut labeled_elements = BTreeSet::new();
    for (key, percentiles) in labels.iter() {
        let (mass_number, element) = parse_isotope_label(key)?;
        let natural =
            natural_isotopes(element).ok_or_else(|| MZQuantError::UnknownElement(key.clone()))?;
        labeled_elements.insert(element.to_string());
        for percentile in percentiles.iter().copied() {
            if percentile > f64::EPSILON {
                let distribution =
                    recalculate_distribution(element, &natural, percentile, mass_number)?;
                distributions
                    .entry(element.to_string())
                    .or_default()
                    .insert(format_percentile(percentile), distribution);
            }
        }
    }
    if labeled_elements.is_empty() {
        labeled_elements.insert("N".to_string());
    }
    Ok((distributions, labeled_elements))
}

/// The distribution and enrichment level of an isotope prefixed key. The natural
/// most abundant isotope keeps the natural distribution at level zero.
fn isotope_key_distribution(
    key: &str,
    level: Option<f64>,
) -> Result<(f64, Vec<Isotope>), MZQuantError> {
    let (mass_number, template) = split_isotope_key(key);
    let mass_number = mass_number.ok_or_else(|| MZQuantError::MalformedFormula(key.to_string()))?;
    let natural =
        natural_isotopes(template).ok_or_else(|| MZQuantError::UnknownElement(key.to_string()))?;
    if most_abundant(&natural).map(|iso| iso.mass_number()) == Some(mass_number) {
        return Ok((0.0, natural));
    }
    let level = level.unwrap_or(Params::DEFAULT_FIXED_LABEL_ENRICHMENT);
    let distribution = recalculate_distribution(template, &natural, level, mass_number)?;
    Ok((level, distribution))
}

fn add_isotope_key_distribution(
    distributions: &mut Distributions,
    key: &str,
    fixed_label_levels: &BTreeMap<String, f64>,
) -> Result<(), MZQuantError> {
    if split_isotope_key(key).0.is_none() {
        return Err(MZQuantError::UnknownElement(key.to_string()));
    }
    let (level, distribution) = isotope_key_distribution(key, fixed_label_levels.get(key).copied())?;
    debug!("Adding {key} enriched to {level}");
    distributions
        .entry(key.to_string())
        .or_default()
        .insert(format_percentile(level), distribution);
    Ok(())
}

/// Create a residue `{aa}{index}` for every fixed label definition and the enriched
/// distributions of the isotopes they introduce
fn register_fixed_label_residues(
    knowledge: &mut ChemicalKnowledge,
    distributions: &mut Distributions,
    fixed_label_levels: &mut BTreeMap<String, f64>,
    fixed_labels: &FixedLabels,
) -> Result<(), MZQuantError> {
    for (aa, definitions) in fixed_labels.iter() {
        let base = knowledge
            .amino_acid(aa)
            .cloned()
            .ok_or_else(|| MZQuantError::UnknownAminoAcid(aa.clone(), aa.clone()))?;
        for (index, definition) in definitions.iter().enumerate() {
            let mut residue = &base + &knowledge.parse_label_definition(definition);
            residue.retain_nonzero();
            for key in residue.keys() {
                if split_isotope_key(key).0.is_none() {
                    continue;
                }
                let (level, distribution) =
                    isotope_key_distribution(key, fixed_label_levels.get(key).copied())?;
                fixed_label_levels.insert(key.to_string(), level);
                distributions
                    .entry(key.to_string())
                    .or_default()
                    .insert(format_percentile(level), distribution);
            }
            debug!("Fixed label residue {aa}{index} is {residue}");
            knowledge.insert_amino_acid(format!("{aa}{index}"), residue);
        }
    }
    Ok(())
}

fn has_two_isotopes(key: &str) -> bool {
    let (_, symbol) = split_isotope_key(key);
    natural_isotopes(symbol).is_some_and(|isotopes| isotopes.len() == 2)
}

fn build_element_trees(
    distributions: &Distributions,
    highest_count: &BTreeMap<String, usize>,
    two_isotope_start: usize,
    min_abundance: f64,
) -> ElementTrees {
    let mut trees = ElementTrees::new();
    for (key, count) in highest_count.iter() {
        let Some(by_level) = distributions.get(key) else {
            continue;
        };
        let entry = trees.entry(key.clone()).or_default();
        for (percentile, distribution) in by_level.iter() {
            trace!("Building {key} at {percentile} up to {count} atoms");
            entry.insert(
                percentile.clone(),
                ElementTree::build(distribution, *count, two_isotope_start, min_abundance),
            );
        }
    }
    trees
}

/// Fold isotope prefixed keys into their template element when the label
/// combination holds the enrichment level they were built for
fn merge_labeled_isotopes(
    composition: &Composition,
    label_percentiles: &LabelPercentiles,
    fixed_label_levels: &BTreeMap<String, f64>,
) -> Composition {
    let mut merged = composition.clone();
    for (key, level) in fixed_label_levels.iter() {
        if !merged.contains_key(key) {
            continue;
        }
        let (_, template) = split_isotope_key(key);
        if label_percentiles.contains(template, &format_percentile(*level)) {
            if let Some(count) = merged.remove(key) {
                merged.add_element(template, count);
            }
        }
    }
    merged
}

/// The envelope of `count` atoms of `element`. Labeled elements use the level of
/// `label_percentiles`, any other element its lowest built level.
fn element_envelope<'a>(
    trees: &'a ElementTrees,
    element: &str,
    count: usize,
    label_percentiles: &LabelPercentiles,
    labeled_elements: &BTreeSet<String>,
) -> Result<&'a ElementEnvelope, MZQuantError> {
    let by_level = trees.get(element);
    let from_labels = if labeled_elements.contains(element) {
        label_percentiles.get(element)
    } else {
        None
    };
    let percentile = from_labels
        .or_else(|| by_level.and_then(|t| t.keys().next().map(|s| s.as_str())))
        .unwrap_or(NATURAL_PERCENTILE);
    by_level
        .and_then(|t| t.get(percentile))
        .and_then(|tree| tree.level(count))
        .ok_or_else(|| {
            MZQuantError::MissingEnvelope(element.to_string(), count, percentile.to_string())
        })
}

fn build_isotopologue(
    formula: &str,
    composition: &Composition,
    label_percentiles: &LabelPercentiles,
    labeled_elements: &BTreeSet<String>,
    trees: &ElementTrees,
    charges: &[i32],
    params: &Params,
) -> Result<Isotopologue, MZQuantError> {
    let merged = merge_labeled_isotopes(
        composition,
        label_percentiles,
        &params.fixed_label_isotope_enrichment_levels,
    );
    let mut envelopes = Vec::with_capacity(merged.len());
    for (element, count) in merged.iter() {
        envelopes.push(element_envelope(
            trees,
            element,
            count as usize,
            label_percentiles,
            labeled_elements,
        )?);
    }
    let zero_position: usize = envelopes.iter().map(|e| e.min_position).sum();

    // position -> (total abundance, abundance weighted mass)
    let mut positions: BTreeMap<usize, (f64, f64)> = BTreeMap::new();
    for offsets in envelopes
        .iter()
        .map(|e| 0..e.width())
        .multi_cartesian_product()
    {
        let mut abundance = 1.0;
        let mut mass = 0.0;
        for (envelope, offset) in envelopes.iter().zip(offsets.iter()) {
            if let Some(peak) = envelope.at_offset(*offset) {
                abundance *= peak.abundance;
                mass += peak.mass;
            }
        }
        let position = zero_position + offsets.iter().sum::<usize>();
        let acc = positions.entry(position).or_default();
        acc.0 += abundance;
        acc.1 += mass * abundance;
    }

    let max_total = positions
        .values()
        .map(|(total, _)| *total)
        .fold(0.0f64, f64::max);
    let peaks: Vec<TheoreticalPeak> = positions
        .into_iter()
        .filter(|(_, (total, _))| *total >= f64::EPSILON)
        .map(|(position, (total, weighted_mass))| {
            let relative_abundance = total / max_total;
            TheoreticalPeak {
                position,
                mass: weighted_mass / total,
                abundance: (total * params.intensity_transformation_factor).round_ties_even()
                    as i64,
                relative_abundance,
                is_c_peak: relative_abundance >= params.min_rel_peak_intensity_for_matching,
            }
        })
        .collect();

    let charge_states = charges
        .iter()
        .map(|charge| charge_state(&peaks, *charge, params))
        .collect();

    Ok(Isotopologue {
        formula: formula.to_string(),
        label_percentiles: label_percentiles.clone(),
        peaks,
        charge_states,
    })
}

/// The transformed m/z window of a theoretical peak at the configured precision
pub fn tmz_range(mz: f64, params: &Params) -> TmzRange {
    let delta = mz * params.rel_mz_range;
    TmzRange::new(
        params.transform_mz(mz - delta),
        params.transform_mz(mz + delta),
    )
}

fn charge_state(peaks: &[TheoreticalPeak], charge: i32, params: &Params) -> ChargeState {
    let mut mzs = Vec::with_capacity(peaks.len());
    let mut tmzs = Vec::with_capacity(peaks.len());
    let mut atmzs = TmzSet::default();
    for peak in peaks {
        let mut mz = (peak.mass + charge as f64 * PROTON) / charge.abs() as f64;
        if params.machine_offset_in_ppm != 0.0 {
            mz += mz * 1e-6 * params.machine_offset_in_ppm;
        }
        mzs.push(mz);
        if peak.is_c_peak {
            let range = tmz_range(mz, params);
            atmzs.extend(range.iter());
            tmzs.push(Some(range));
        } else {
            tmzs.push(None);
        }
    }
    ChargeState {
        charge,
        mz: mzs,
        tmzs,
        atmzs,
    }
}

fn build_match_sets(
    entries: &[MatchEntry],
    patterns: &BTreeMap<String, BTreeMap<LabelPercentiles, Isotopologue>>,
    bin_size: usize,
) -> Vec<MatchSet> {
    let bin_size = bin_size.max(1);
    let mut sets = Vec::with_capacity(entries.len() / bin_size + 1);
    for start in (0..entries.len()).step_by(bin_size) {
        let end = (start + bin_size).min(entries.len());
        let mut tmzs = TmzSet::default();
        let mut mz_range = (f64::INFINITY, f64::NEG_INFINITY);
        for entry in entries[start..end].iter() {
            mz_range.0 = mz_range.0.min(entry.lower_mz);
            mz_range.1 = mz_range.1.max(entry.upper_mz);
            if let Some(state) = patterns
                .get(&entry.formula)
                .and_then(|p| p.get(&entry.label_percentiles))
                .and_then(|iso| iso.charge_state(entry.charge))
            {
                tmzs.extend(state.atmzs.iter().copied());
            }
        }
        sets.push(MatchSet {
            start,
            end,
            tmzs,
            mz_range,
        });
    }
    sets
}

/// Theoretical isotope patterns of a set of molecules, ready for matching
#[derive(Debug, Clone)]
pub struct IsotopologueLibrary {
    params: Params,
    charges: Vec<i32>,
    lookup: Lookup,
    labeled_elements: BTreeSet<String>,
    label_percentiles: Vec<LabelPercentiles>,
    patterns: BTreeMap<String, BTreeMap<LabelPercentiles, Isotopologue>>,
    match_entries: Vec<MatchEntry>,
    match_sets: Vec<MatchSet>,
    mz_range: Option<(f64, f64)>,
}

impl IsotopologueLibrary {
    pub fn builder() -> IsotopologueLibraryBuilder {
        IsotopologueLibraryBuilder::new()
    }

    /// The parameters the library was built with, including the enrichment levels
    /// of fixed label isotopes added during the build
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn charges(&self) -> &[i32] {
        &self.charges
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    pub fn labeled_elements(&self) -> &BTreeSet<String> {
        &self.labeled_elements
    }

    pub fn label_percentiles(&self) -> &[LabelPercentiles] {
        &self.label_percentiles
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn formulas(&self) -> impl Iterator<Item = &str> + '_ {
        self.patterns.keys().map(|s| s.as_str())
    }

    pub fn isotopologues(&self, formula: &str) -> Option<&BTreeMap<LabelPercentiles, Isotopologue>> {
        self.patterns.get(formula)
    }

    pub fn isotopologue(
        &self,
        formula: &str,
        label_percentiles: &LabelPercentiles,
    ) -> Option<&Isotopologue> {
        self.patterns
            .get(formula)
            .and_then(|p| p.get(label_percentiles))
    }

    pub fn match_entries(&self) -> &[MatchEntry] {
        &self.match_entries
    }

    pub fn match_sets(&self) -> &[MatchSet] {
        &self.match_sets
    }

    /// The m/z span of all match sets, `None` if nothing can be matched
    pub fn mz_range(&self) -> Option<(f64, f64)> {
        self.mz_range
    }

    /// Render a table of the isotope patterns of a molecule or formula at `charge`
    pub fn overview(&self, name: &str, charge: i32) -> Option<String> {
        let formula = self.lookup.formula_of(name)?;
        let patterns = self.patterns.get(formula)?;
        let mut buffer = String::new();
        let _ = writeln!(buffer, "> Chemical formula {formula}");
        if let Some(names) = self.lookup.formula_to_trivial_names.get(formula) {
            let _ = writeln!(
                buffer,
                "> Trivial name{} {}",
                if names.len() == 1 { "" } else { "s" },
                names.iter().join(", ")
            );
        }
        for (label_percentiles, isotopologue) in patterns.iter() {
            let state = isotopologue.charge_state(charge)?;
            let _ = writeln!(buffer, "> Label percentile {label_percentiles}");
            let _ = writeln!(
                buffer,
                "pos\t            Mass\t      m/z [MH]{charge:+}\t  Abundance\t        rel.\tc-peak"
            );
            for (n, (peak, mz)) in isotopologue.peaks.iter().zip(state.mz.iter()).enumerate() {
                let c_position = if peak.is_c_peak {
                    peak.position.to_string()
                } else {
                    "-".to_string()
                };
                let _ = writeln!(
                    buffer,
                    "{n:>3}\t{:16.10}\t{:16.10}\t{:10}\t{:12.11}\t{c_position}",
                    peak.mass, mz, peak.abundance, peak.relative_abundance
                );
            }
        }
        Some(buffer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn build(molecules: &[&str], charges: &[i32]) -> IsotopologueLibrary {
        IsotopologueLibrary::builder()
            .molecules(molecules.iter().copied())
            .charges(charges.iter().copied())
            .build()
            .unwrap()
    }

    fn most_intense_mass(iso: &Isotopologue) -> f64 {
        iso.peaks
            .iter()
            .max_by(|a, b| a.relative_abundance.total_cmp(&b.relative_abundance))
            .map(|p| p.mass)
            .unwrap()
    }

    fn natural() -> LabelPercentiles {
        [("N", "0.000")].into_iter().collect()
    }

    #[test]
    fn test_unlabeled_element_uses_lowest_level() {
        let natural_c = natural_isotopes("C").unwrap();
        let enriched_c = recalculate_distribution("C", &natural_c, 0.5, 13).unwrap();
        let mut trees = ElementTrees::new();
        let by_level = trees.entry("C".to_string()).or_default();
        by_level.insert(
            NATURAL_PERCENTILE.to_string(),
            ElementTree::build(&natural_c, 3, 1, 1e-3),
        );
        by_level.insert("0.500".to_string(), ElementTree::build(&enriched_c, 3, 1, 1e-3));

        let envelope = element_envelope(&trees, "C", 3, &natural(), &BTreeSet::new()).unwrap();
        let lowest = trees["C"][NATURAL_PERCENTILE].level(3).unwrap();
        assert!(std::ptr::eq(envelope, lowest));

        let labeled: BTreeSet<String> = ["C".to_string()].into_iter().collect();
        let percentiles: LabelPercentiles = [("C", "0.500")].into_iter().collect();
        let envelope = element_envelope(&trees, "C", 3, &percentiles, &labeled).unwrap();
        assert!(std::ptr::eq(envelope, trees["C"]["0.500"].level(3).unwrap()));
    }

    #[test_log::test]
    fn test_peptide_pattern() {
        let lib = build(&["PEPTIDE"], &[1]);
        let formula = lib.lookup().formula_of("PEPTIDE").unwrap();
        assert_eq!(formula, "C(34)H(53)N(7)O(15)");
        let iso = lib.isotopologue(formula, &natural()).unwrap();
        let state = iso.charge_state(1).unwrap();

        assert!((iso.peaks[0].mass - 799.3599640346).abs() < 1e-6);
        assert!((state.mz[0] - 800.4472772254).abs() < 1e-6);
        assert_eq!(iso.peaks[0].abundance, 64799);
        assert_eq!(iso.peaks[0].relative_abundance, 1.0);
        assert!((iso.peaks[1].relative_abundance - 0.40511743373).abs() < 1e-6);
        assert_eq!(iso.n_c_peaks(), 4);
        assert!(state.tmzs[3].is_some());
        assert!(state.tmzs[4].is_none());

        let text = lib.overview("PEPTIDE", 1).unwrap();
        assert!(text.contains("C(34)H(53)N(7)O(15)"));
        assert!(text.contains("Label percentile N:0.000"));
        assert!(lib.overview("PEPTIDE", 3).is_none());
    }

    #[test_log::test]
    fn test_testpeptide_abundances() {
        let lib = build(&["TESTPEPTIDE", "TESTPEPTIDE#Oxidation:1"], &[2]);
        let cases = [
            (
                "TESTPEPTIDE",
                "C(50)H(79)N(11)O(24)",
                [52441, 31423, 11803, 3313, 763, 134, 23, 2, 0, 0, 0],
                (609769, 609775),
            ),
            (
                "TESTPEPTIDE#Oxidation:1",
                "C(50)H(79)N(11)O(25)",
                [52314, 31367, 11894, 3374, 787, 140, 24, 3, 0, 0, 0],
                (617767, 617773),
            ),
        ];
        for (molecule, formula, abundances, (start, end)) in cases {
            assert_eq!(lib.lookup().molecule_to_formula[molecule], formula);
            let iso = lib.isotopologue(formula, &natural()).unwrap();
            let observed: Vec<i64> = iso.peaks.iter().map(|p| p.abundance).collect();
            assert_eq!(observed, abundances);
            let state = iso.charge_state(2).unwrap();
            assert_eq!(state.tmzs[0], Some(TmzRange::new(start, end)));
            assert!(state.atmzs.contains(&start));
            assert!(state.atmzs.contains(&end));
        }
    }

    #[test]
    fn test_metabolic_label_tuples() {
        let mut labels = MetabolicLabels::new();
        labels.insert("15N".to_string(), vec![0.0, 0.99]);
        let lib = IsotopologueLibrary::builder()
            .molecules(["PEPTIDE"])
            .charges([2])
            .metabolic_labels(labels)
            .build()
            .unwrap();
        let patterns = lib.isotopologues("C(34)H(53)N(7)O(15)").unwrap();
        assert_eq!(patterns.len(), 2);
        let heavy: LabelPercentiles = [("N", "0.990")].into_iter().collect();
        let light = &patterns[&natural()];
        let heavy = &patterns[&heavy];
        // seven nitrogens shifted by about one dalton each
        let shift = most_intense_mass(heavy) - most_intense_mass(light);
        assert!((shift - 7.0 * 0.997).abs() < 0.1, "{shift}");
        assert_eq!(lib.match_entries().len(), 2);
    }

    #[test]
    fn test_oxygen_label() {
        let mut labels = MetabolicLabels::new();
        labels.insert("18O".to_string(), vec![0.0, 0.5]);
        let lib = IsotopologueLibrary::builder()
            .molecules(["+H2O"])
            .charges([1])
            .metabolic_labels(labels)
            .params(Params {
                lower_mz_limit: 0.0,
                ..Default::default()
            })
            .build()
            .unwrap();
        assert!(lib.labeled_elements().contains("O"));
        let half: LabelPercentiles = [("O", "0.500")].into_iter().collect();
        let iso = lib.isotopologue("H(2)O(1)", &half).unwrap();
        // 16O and 18O are two positions apart
        let abundant: Vec<usize> = iso
            .peaks
            .iter()
            .filter(|p| p.relative_abundance > 0.5)
            .map(|p| p.position)
            .collect();
        assert_eq!(abundant, vec![0, 2]);
    }

    #[test]
    fn test_fixed_labels() {
        let mut fixed = FixedLabels::new();
        fixed.insert(
            "R".to_string(),
            vec!["".to_string(), "Label:13C(6)15N(4)".to_string()],
        );
        let lib = IsotopologueLibrary::builder()
            .molecules(["ELVISR", "PEPTIDE"])
            .charges([2])
            .fixed_labels(fixed)
            .build()
            .unwrap();
        let variants = &lib.lookup().molecule_fixed_label_variations["ELVISR"];
        assert_eq!(
            variants.iter().cloned().collect_vec(),
            vec!["ELVISR0".to_string(), "ELVISR1".to_string()]
        );
        assert!(!lib
            .lookup()
            .molecule_fixed_label_variations
            .contains_key("PEPTIDE"));

        let light = &lib.lookup().molecule_to_formula["ELVISR0"];
        let heavy = &lib.lookup().molecule_to_formula["ELVISR1"];
        assert!(heavy.contains("13C(6)"));
        assert!(heavy.contains("15N(4)"));
        assert_eq!(lib.params().fixed_label_isotope_enrichment_levels["15N"], 0.994);

        let light = lib.isotopologue(light, &natural()).unwrap();
        let heavy = lib.isotopologue(heavy, &natural()).unwrap();
        let shift = most_intense_mass(heavy) - most_intense_mass(light);
        assert!((shift - 10.008).abs() < 0.05, "{shift}");
        // the partially labeled forms start below the fully labeled peak
        assert!(heavy.peaks[0].mass - light.peaks[0].mass < shift);
    }

    #[test]
    fn test_fixed_modifications_stripped_from_evidence() {
        use crate::evidence::Evidence;

        let mut fixed = FixedLabels::new();
        fixed.insert("C".to_string(), vec!["Carbamidomethyl".to_string()]);
        let mut evidences = EvidenceLookup::new();
        evidences.insert(
            "CCTESLVNR#Carbamidomethyl:1;Carbamidomethyl:2".to_string(),
            MoleculeEvidence {
                evidences: vec![Evidence {
                    rt: Some(40.0),
                    ..Default::default()
                }],
                trivial_names: BTreeSet::new(),
            },
        );
        let lib = IsotopologueLibrary::builder()
            .evidences(evidences)
            .fixed_labels(fixed)
            .metabolic_labels([("15N".to_string(), vec![0.0, 0.99])].into_iter().collect())
            .build()
            .unwrap();

        assert!(lib
            .lookup()
            .molecule_fixed_label_variations
            .contains_key("CCTESLVNR"));
        let (formula, evidences) = lib.lookup().formula_to_evidences.iter().next().unwrap();
        assert_eq!(lib.lookup().formula_to_evidences.len(), 1);
        assert!(evidences.contains_key("CCTESLVNR"));
        assert_eq!(formula, "C(43)H(75)14N(2)N(13)O(17)S(2)");
        assert!(lib
            .lookup()
            .molecule_to_formula
            .keys()
            .all(|m| !m.contains('#')));
    }

    #[test]
    fn test_fixed_label_errors() {
        let mut fixed = FixedLabels::new();
        fixed.insert("R".to_string(), vec!["".to_string(), "Label:13C(6)".to_string()]);
        let result = IsotopologueLibrary::builder()
            .molecules(["ELVISR"])
            .fixed_labels(fixed.clone())
            .params(Params {
                silac_aas_locked_in_experiment: Some(vec!["R".to_string()]),
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(MZQuantError::LockedAminoAcidsTooFew(_))));

        fixed.insert("J".to_string(), vec!["".to_string()]);
        let result = IsotopologueLibrary::builder()
            .molecules(["ELVISR"])
            .fixed_labels(fixed)
            .build();
        assert!(matches!(result, Err(MZQuantError::UnknownAminoAcid(_, _))));
    }

    #[test]
    fn test_negative_composition_is_rejected() {
        let result = IsotopologueLibrary::builder()
            .molecules(["+H2O-O2"])
            .build();
        assert!(matches!(result, Err(MZQuantError::NegativeElementCount(_, _))));
    }

    #[test]
    fn test_lookups_and_trivial_names() {
        let mut names = BTreeMap::new();
        names.insert("DDSPDLPK".to_string(), "BSA".to_string());
        let lib = IsotopologueLibrary::builder()
            .molecules(["DDSPDLPK", "KPLDPSDD"])
            .trivial_names(names)
            .build()
            .unwrap();
        let formula = "C(37)H(59)N(9)O(16)";
        assert_eq!(lib.len(), 1);
        assert_eq!(lib.lookup().formula_to_molecules[formula].len(), 2);
        assert!(lib.lookup().formula_to_trivial_names[formula].contains("BSA"));
        assert_eq!(lib.lookup().formula_of(formula), Some(formula));
        assert_eq!(lib.lookup().formula_of("KPLDPSDD"), Some(formula));
        assert_eq!(lib.lookup().formula_of("ELVISLIVES"), None);
    }

    #[test]
    fn test_match_sets() {
        let lib = IsotopologueLibrary::builder()
            .molecules(["PEPTIDE", "TESTPEPTIDE", "DDSPDLPK"])
            .charges([1, 2, 3])
            .params(Params {
                max_molecules_per_match_bin: 2,
                ..Default::default()
            })
            .build()
            .unwrap();
        let entries = lib.match_entries();
        assert_eq!(entries.len(), 9);
        assert!(entries
            .windows(2)
            .all(|w| w[0].lower_mz <= w[1].lower_mz));
        let sets = lib.match_sets();
        assert_eq!(sets.len(), 5);
        assert_eq!(sets.iter().map(|s| s.len()).sum::<usize>(), 9);
        assert_eq!(sets[4].len(), 1);
        let (lo, hi) = lib.mz_range().unwrap();
        assert_eq!(lo, entries[0].lower_mz);
        assert!(hi >= entries.iter().map(|e| e.upper_mz).fold(0.0, f64::max));
        for set in sets {
            for entry in &entries[set.start..set.end] {
                let state = lib
                    .isotopologue(&entry.formula, &entry.label_percentiles)
                    .and_then(|i| i.charge_state(entry.charge))
                    .unwrap();
                assert!(state.atmzs.is_subset(&set.tmzs));
            }
        }
    }
}
