//! Storage and analysis of isotopologue matches.
//!
//! [`Results`] groups every accepted match under a [`MatchKey`] of input file,
//! chemical formula, charge and label percentiles. On top of the raw matches it
//! derives molecule amounts over retention time windows, measurement errors, label
//! efficiencies and pairings of light and heavy forms.
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::MZQuantError;
use crate::evidence::MoleculeEvidence;
use crate::labels::LabelPercentiles;
use crate::library::Lookup;
use crate::params::{format_percentile, Params};
use crate::scorer::{MatchedPeak, ScoreType};

/// Identifies the series of matches of one isotopologue in one input file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey {
    pub file_name: String,
    pub formula: String,
    pub charge: i32,
    pub label_percentiles: LabelPercentiles,
}

impl MatchKey {
    pub fn new<F: Into<String>, S: Into<String>>(
        file_name: F,
        formula: S,
        charge: i32,
        label_percentiles: LabelPercentiles,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            formula: formula.into(),
            charge,
            label_percentiles,
        }
    }
}

/// A single isotopologue matched in a spectrum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub spec_id: String,
    /// Retention time in minutes
    pub rt: f64,
    pub score: ScoreType,
    /// The factor scaling the theoretical pattern to the measured one, used as
    /// the amount of the molecule in the spectrum
    pub scaling_factor: f64,
    pub peaks: Vec<MatchedPeak>,
}

impl Match {
    pub fn new<S: Into<String>>(
        spec_id: S,
        rt: f64,
        score: ScoreType,
        scaling_factor: f64,
        peaks: Vec<MatchedPeak>,
    ) -> Self {
        Self {
            spec_id: spec_id.into(),
            rt,
            score,
            scaling_factor,
            peaks,
        }
    }

    pub fn observed_peaks(&self) -> usize {
        self.peaks.iter().filter(|p| p.is_matched()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub data: Vec<Match>,
    pub max_score: ScoreType,
    pub max_score_index: Option<usize>,
    pub len_data: usize,
}

impl Default for ResultEntry {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            max_score: -1.0,
            max_score_index: None,
            len_data: 0,
        }
    }
}

impl ResultEntry {
    fn push(&mut self, entry: Match) {
        if self.max_score < entry.score {
            self.max_score = entry.score;
            self.max_score_index = Some(self.data.len());
        }
        self.len_data += 1;
        self.data.push(entry);
    }

    pub fn best(&self) -> Option<&Match> {
        self.max_score_index.and_then(|i| self.data.get(i))
    }

    /// Append the matches of `other`, keeping the series in retention time order
    fn extend(&mut self, other: ResultEntry) {
        let mut data = std::mem::take(&mut self.data);
        data.extend(other.data);
        data.sort_by(|a, b| a.rt.total_cmp(&b.rt));
        self.max_score = -1.0;
        self.max_score_index = None;
        self.len_data = 0;
        for entry in data {
            self.push(entry);
        }
    }
}

/// The distinct key components seen so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultIndex {
    pub files: BTreeSet<String>,
    pub charges: BTreeSet<i32>,
    pub formulas: BTreeSet<String>,
    pub label_percentiles: BTreeSet<LabelPercentiles>,
}

impl ResultIndex {
    fn insert(&mut self, key: &MatchKey) {
        self.files.insert(key.file_name.clone());
        self.charges.insert(key.charge);
        self.formulas.insert(key.formula.clone());
        self.label_percentiles.insert(key.label_percentiles.clone());
    }
}

/// Selects a subset of the stored results. A criterion left as `None` does not
/// filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFilter {
    pub molecules: Option<Vec<String>>,
    pub file_names: Option<Vec<String>>,
    pub charges: Option<Vec<i32>>,
    pub label_percentiles: Option<Vec<LabelPercentiles>>,
    pub formulas: Option<Vec<String>>,
    pub score_threshold: Option<ScoreType>,
}

impl ResultFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn molecules<I: IntoIterator<Item = S>, S: Into<String>>(mut self, molecules: I) -> Self {
        self.molecules = Some(molecules.into_iter().map(Into::into).collect());
        self
    }

    pub fn file_names<I: IntoIterator<Item = S>, S: Into<String>>(mut self, file_names: I) -> Self {
        self.file_names = Some(file_names.into_iter().map(Into::into).collect());
        self
    }

    pub fn charges<I: IntoIterator<Item = i32>>(mut self, charges: I) -> Self {
        self.charges = Some(charges.into_iter().collect());
        self
    }

    pub fn label_percentiles<I: IntoIterator<Item = LabelPercentiles>>(
        mut self,
        label_percentiles: I,
    ) -> Self {
        self.label_percentiles = Some(label_percentiles.into_iter().collect());
        self
    }

    pub fn formulas<I: IntoIterator<Item = S>, S: Into<String>>(mut self, formulas: I) -> Self {
        self.formulas = Some(formulas.into_iter().map(Into::into).collect());
        self
    }

    pub fn score_threshold(mut self, score_threshold: ScoreType) -> Self {
        self.score_threshold = Some(score_threshold);
        self
    }
}

/// A [`ResultFilter`] with molecules translated into formulas
struct KeyPredicate {
    file_names: Option<BTreeSet<String>>,
    formulas: Option<BTreeSet<String>>,
    charges: Option<BTreeSet<i32>>,
    label_percentiles: Option<BTreeSet<LabelPercentiles>>,
}

impl KeyPredicate {
    fn accepts(&self, key: &MatchKey) -> bool {
        self.file_names
            .as_ref()
            .map_or(true, |f| f.contains(&key.file_name))
            && self
                .formulas
                .as_ref()
                .map_or(true, |f| f.contains(&key.formula))
            && self
                .charges
                .as_ref()
                .map_or(true, |c| c.contains(&key.charge))
            && self
                .label_percentiles
                .as_ref()
                .map_or(true, |l| l.contains(&key.label_percentiles))
    }
}

/// One match with its key, flattened into a table row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatMatch<'a> {
    pub file_name: &'a str,
    pub formula: &'a str,
    pub charge: i32,
    pub label_percentiles: &'a LabelPercentiles,
    pub spec_id: &'a str,
    pub rt: f64,
    pub score: ScoreType,
    pub scaling_factor: f64,
    pub peaks: &'a [MatchedPeak],
}

/// The intensities of a molecule over retention time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElutionProfile {
    pub rt: Vec<f64>,
    pub intensity: Vec<f64>,
    pub scores: Vec<ScoreType>,
    pub spec_ids: Vec<String>,
}

impl ElutionProfile {
    pub fn push(&mut self, entry: &Match) {
        self.rt.push(entry.rt);
        self.intensity.push(entry.scaling_factor);
        self.scores.push(entry.score);
        self.spec_ids.push(entry.spec_id.clone());
    }

    pub fn len(&self) -> usize {
        self.intensity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensity.is_empty()
    }
}

/// The amount of a molecule derived from an [`ElutionProfile`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Amount {
    pub max_intensity: f64,
    pub max_intensity_rt: f64,
    pub max_intensity_score: ScoreType,
    pub auc: Option<f64>,
    pub sum_intensity: Option<f64>,
}

/// Find the maximum intensity of a profile with its retention time and score.
/// Ties resolve to the earliest point.
pub fn determine_max_intensity(profile: &ElutionProfile) -> Option<Amount> {
    let mut best: Option<(usize, f64)> = None;
    for (i, intensity) in profile.intensity.iter().copied().enumerate() {
        match best {
            Some((_, current)) if intensity <= current => {}
            _ => best = Some((i, intensity)),
        }
    }
    let (index, max_intensity) = best?;
    Some(Amount {
        max_intensity,
        max_intensity_rt: *profile.rt.get(index)?,
        max_intensity_score: *profile.scores.get(index)?,
        auc: None,
        sum_intensity: None,
    })
}

/// [`determine_max_intensity`] plus the summed intensity and the area under the
/// profile by the trapezoidal rule. The profile must be in retention time order.
pub fn calc_amount(profile: &ElutionProfile) -> Option<Amount> {
    let mut amount = determine_max_intensity(profile)?;
    amount.sum_intensity = Some(profile.intensity.iter().sum());
    let auc = profile
        .rt
        .iter()
        .zip(profile.intensity.iter())
        .tuple_windows()
        .map(|((x0, y0), (x1, y1))| (x1 - x0) * (y0 + y1) / 2.0)
        .sum();
    amount.auc = Some(auc);
    Some(amount)
}

/// Smooth `values` with a sliding mean over `k` points. Positions outside the list
/// count as zero. Even windows reach one point further to the right.
pub fn smooth_list(values: &[f64], k: usize) -> Vec<f64> {
    let k = k.max(1);
    let lower = -((k / 2) as isize);
    let upper = k.div_ceil(2) as isize + if k % 2 == 0 { 1 } else { 0 };
    let n = values.len() as isize;
    (0..n)
        .map(|pos| {
            let total: f64 = (lower..upper)
                .map(|offset| pos + offset)
                .filter(|i| (0..n).contains(i))
                .map(|i| values[i as usize])
                .sum();
            total / k as f64
        })
        .collect()
}

/// The retention time window of a molecule derived from its evidences
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RtWindow {
    /// The earliest and latest evidence, in minutes
    pub rt_window: (f64, f64),
    /// Replaces the border tolerance below the window when set
    pub lower_window_border: Option<f64>,
    /// Replaces the border tolerance above the window when set
    pub upper_window_border: Option<f64>,
    pub window_is_unseparable: bool,
}

impl RtWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            rt_window: (start, end),
            lower_window_border: None,
            upper_window_border: None,
            window_is_unseparable: false,
        }
    }

    pub fn start(&self, tolerance: f64) -> f64 {
        self.rt_window.0 - self.lower_window_border.unwrap_or(tolerance)
    }

    pub fn stop(&self, tolerance: f64) -> f64 {
        self.rt_window.1 + self.upper_window_border.unwrap_or(tolerance)
    }
}

/// Build retention time windows for the molecules sharing a formula.
///
/// Neighbouring windows that come closer than twice `tolerance` split the gap
/// between them. When the split would leave a window without room, both windows
/// are marked unseparable and keep the plain tolerance.
pub fn curate_rt_windows(
    evidences: &BTreeMap<String, MoleculeEvidence>,
    tolerance: f64,
) -> BTreeMap<String, RtWindow> {
    let mut windows: Vec<((f64, f64), &str)> = evidences
        .iter()
        .filter_map(|(molecule, evidence)| {
            let (start, end) = evidence
                .evidences
                .iter()
                .filter_map(|e| e.rt)
                .fold(None, |acc: Option<(f64, f64)>, rt| match acc {
                    Some((lo, hi)) => Some((lo.min(rt), hi.max(rt))),
                    None => Some((rt, rt)),
                })?;
            Some(((start, end), molecule.as_str()))
        })
        .collect();
    windows.sort_by(|(a, name_a), (b, name_b)| {
        a.0.total_cmp(&b.0)
            .then(a.1.total_cmp(&b.1))
            .then(name_a.cmp(name_b))
    });

    let mut curated: BTreeMap<String, RtWindow> = BTreeMap::new();
    for (pos, ((start, end), molecule)) in windows.iter().enumerate() {
        curated.insert(molecule.to_string(), RtWindow::new(*start, *end));
        if pos == 0 {
            continue;
        }
        let ((last_start, last_end), last_molecule) = windows[pos - 1];
        if start - tolerance > last_end + tolerance {
            continue;
        }
        let half = (start - last_end) / 2.0;
        let (current_lower, current_upper) = {
            let w = &curated[*molecule];
            (
                w.lower_window_border.unwrap_or(tolerance),
                w.upper_window_border.unwrap_or(tolerance),
            )
        };
        let (last_lower, last_upper) = {
            let w = &curated[last_molecule];
            (
                w.lower_window_border.unwrap_or(tolerance),
                w.upper_window_border.unwrap_or(tolerance),
            )
        };

        let unseparable = start - half > end + current_upper
            || last_end - half < last_start - last_lower
            || (last_start - last_lower < start - current_lower
                && last_end + last_upper > end + current_upper);

        if unseparable {
            debug!("Retention time windows of {last_molecule} and {molecule} overlap");
            for name in [last_molecule, *molecule] {
                if let Some(w) = curated.get_mut(name) {
                    w.window_is_unseparable = true;
                    w.lower_window_border = None;
                    w.upper_window_border = None;
                }
            }
        } else {
            if let Some(w) = curated.get_mut(*molecule) {
                w.lower_window_border = Some(half);
            }
            if let Some(w) = curated.get_mut(last_molecule) {
                w.upper_window_border = Some(half);
            }
        }
    }
    curated
}

/// Measured minus calculated deviations of the most abundant matched peaks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasuredError {
    /// m/z errors in ppm
    pub mz_error: Vec<f64>,
    /// Relative intensity errors, capped at 1
    pub intensity_error: Vec<f64>,
    /// m/z errors grouped by the retention time rounded to whole minutes
    pub time_dependent_mz_error: BTreeMap<i64, Vec<f64>>,
    pub time_dependent_intensity_error: BTreeMap<i64, Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelEfficiencyBin {
    pub percentile: f64,
    pub mscore: ScoreType,
    /// The summed amount of all matches in this bin
    pub count: f64,
}

/// A row of the retention time window summary table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtInfoRow {
    pub file_name: String,
    pub formula: String,
    #[serde(default)]
    pub molecule: String,
    #[serde(rename = "trivial_name(s)", default)]
    pub trivial_names: String,
    pub label_percentiles: String,
    pub charge: i32,
    #[serde(rename = "start (min)", default)]
    pub start: Option<f64>,
    #[serde(rename = "stop (min)", default)]
    pub stop: Option<f64>,
    #[serde(rename = "max I in window", default)]
    pub max_intensity: Option<f64>,
    #[serde(rename = "max I in window (rt)", default)]
    pub max_intensity_rt: Option<f64>,
    #[serde(rename = "max I in window (score)", default)]
    pub max_intensity_score: Option<f64>,
    #[serde(rename = "auc in window", default)]
    pub auc: Option<f64>,
    #[serde(rename = "sum I in window", default)]
    pub sum_intensity: Option<f64>,
    #[serde(rename = "evidences (min)", default)]
    pub evidences: String,
}

impl RtInfoRow {
    fn update_amount(&mut self, amount: &Amount) {
        self.max_intensity = Some(amount.max_intensity);
        self.max_intensity_rt = Some(amount.max_intensity_rt);
        self.max_intensity_score = Some(amount.max_intensity_score);
        if amount.auc.is_some() {
            self.auc = amount.auc;
        }
        if amount.sum_intensity.is_some() {
            self.sum_intensity = amount.sum_intensity;
        }
    }
}

/// Numbered mzTab metadata, keyed by the metadata name, e.g. `fixed_mod` or
/// `ms_run-location`
pub type MzTabMetaInfo = BTreeMap<String, Vec<String>>;

const MZTAB_MS_RUN_LOCATION: &str = "ms_run-location";
const MZTAB_NULL: &str = "null";
const MZTAB_HEADER: [&str; 7] = [
    "COM\tReport for quantification results of mzquant",
    "MTD\tmzTab-version\t1.0.0",
    "MTD\tmzTab-mode\tSummary",
    "MTD\tmzTab-type\tQuantification",
    "MTD\tdescription\tmzTab quantification results on peptide level",
    "MTD\tpeptide-quantification_unit\t[PRIDE, PRIDE:0000393, Relative quantification unit,]",
    "MTD\tpeptide-quantification_value\t[PRIDE, PRIDE:0000425, MS1 intensity based label-free quantification method,]",
];
const MZTAB_PEPTIDE_COLUMNS: [&str; 8] = [
    "PEH",
    "sequence",
    "accession",
    "modifications",
    "retention_time",
    "retention_time_window",
    "charge",
    "mass_to_charge",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ResultCsvRow<'a> {
    formula: &'a str,
    molecule: Option<&'a str>,
    charge: i32,
    scan_id: &'a str,
    label_percentiles: String,
    intensity: f64,
    retention_time: f64,
    #[serde(rename = "mScore")]
    score: ScoreType,
    file_name: &'a str,
    #[serde(rename = "trivial_name(s)")]
    trivial_names: Option<String>,
    #[serde(rename = "#exp. peaks")]
    expected_peaks: usize,
    #[serde(rename = "#obs. peaks")]
    observed_peaks: usize,
}

mod entry_list {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        entries: &BTreeMap<MatchKey, ResultEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(entries.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<MatchKey, ResultEntry>, D::Error> {
        let items: Vec<(MatchKey, ResultEntry)> = Vec::deserialize(deserializer)?;
        Ok(items.into_iter().collect())
    }
}

/// All matches of a quantification run, with the lookup tables of the library
/// they were matched against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Results {
    pub params: Params,
    pub lookup: Lookup,
    #[serde(with = "entry_list")]
    entries: BTreeMap<MatchKey, ResultEntry>,
    #[serde(default)]
    index: ResultIndex,
}

impl Results {
    pub fn new(params: Params, lookup: Lookup) -> Self {
        Self {
            params,
            lookup,
            entries: BTreeMap::new(),
            index: ResultIndex::default(),
        }
    }

    pub fn add(&mut self, key: MatchKey, value: Match) {
        if self.params.build_result_index {
            self.index.insert(&key);
        }
        self.entries.entry(key).or_default().push(value);
    }

    /// Move all matches of `other` into this collection. Series present in both
    /// are re-ordered by retention time.
    pub fn merge(&mut self, other: Results) {
        for (key, entry) in other.entries {
            if self.params.build_result_index {
                self.index.insert(&key);
            }
            self.entries.entry(key).or_default().extend(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &MatchKey) -> Option<&ResultEntry> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &MatchKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &MatchKey> + '_ {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MatchKey, &ResultEntry)> + '_ {
        self.entries.iter()
    }

    /// The distinct key components, left empty when the parameters disable
    /// `build_result_index`
    pub fn index(&self) -> &ResultIndex {
        &self.index
    }

    /// The total number of stored matches
    pub fn num_matches(&self) -> usize {
        self.entries.values().map(|e| e.len_data).sum()
    }

    /// Map molecules to their formulas, adding them to `formulas`. Unknown
    /// molecules contribute nothing.
    pub fn translate_molecules_to_formulas<S: AsRef<str>>(
        &self,
        molecules: &[S],
        formulas: Option<&[String]>,
    ) -> BTreeSet<String> {
        let mut translated: BTreeSet<String> = formulas
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default();
        for molecule in molecules {
            if let Some(formula) = self.lookup.molecule_to_formula.get(molecule.as_ref()) {
                translated.insert(formula.clone());
            }
        }
        translated
    }

    fn resolve(&self, filter: &ResultFilter) -> KeyPredicate {
        let formulas = match &filter.molecules {
            Some(molecules) => Some(
                self.translate_molecules_to_formulas(molecules.as_slice(), filter.formulas.as_deref()),
            ),
            None => filter
                .formulas
                .as_ref()
                .map(|f| f.iter().cloned().collect()),
        };
        KeyPredicate {
            file_names: filter
                .file_names
                .as_ref()
                .map(|f| f.iter().cloned().collect()),
            formulas,
            charges: filter.charges.as_ref().map(|c| c.iter().copied().collect()),
            label_percentiles: filter
                .label_percentiles
                .as_ref()
                .map(|l| l.iter().cloned().collect()),
        }
    }

    /// The keys which satisfy every criterion of `filter`
    pub fn parse_and_filter<'a>(
        &'a self,
        filter: &ResultFilter,
    ) -> impl Iterator<Item = &'a MatchKey> + 'a {
        let predicate = self.resolve(filter);
        self.entries.keys().filter(move |key| predicate.accepts(key))
    }

    /// Each match under the keys selected by `filter` with its position in the
    /// key's series, skipping matches below the filter's score threshold
    pub fn extract_results<'a>(
        &'a self,
        filter: &ResultFilter,
    ) -> impl Iterator<Item = (&'a MatchKey, usize, &'a Match)> + 'a {
        let predicate = self.resolve(filter);
        let threshold = filter.score_threshold;
        self.entries
            .iter()
            .filter(move |(key, _)| predicate.accepts(key))
            .flat_map(move |(key, entry)| {
                entry
                    .data
                    .iter()
                    .enumerate()
                    .filter(move |(_, m)| threshold.map_or(true, |t| m.score >= t))
                    .map(move |(i, m)| (key, i, m))
            })
    }

    pub fn format_all_results(&self) -> Vec<FlatMatch<'_>> {
        self.entries
            .iter()
            .flat_map(|(key, entry)| {
                entry.data.iter().map(move |m| FlatMatch {
                    file_name: &key.file_name,
                    formula: &key.formula,
                    charge: key.charge,
                    label_percentiles: &key.label_percentiles,
                    spec_id: &m.spec_id,
                    rt: m.rt,
                    score: m.score,
                    scaling_factor: m.scaling_factor,
                    peaks: &m.peaks,
                })
            })
            .collect()
    }

    /// The best scoring match selected by `filter`. The first match wins ties,
    /// and matches scoring zero are never returned.
    pub fn max_score(&self, filter: &ResultFilter) -> Option<(ScoreType, &MatchKey, usize, &Match)> {
        let mut best: Option<(ScoreType, &MatchKey, usize, &Match)> = None;
        for (key, i, entry) in self.extract_results(filter) {
            let current = best.as_ref().map_or(0.0, |b| b.0);
            if entry.score > current {
                best = Some((entry.score, key, i, entry));
            }
        }
        best
    }

    /// Collect the m/z and intensity errors of the `top_x` most abundant matched
    /// peaks of every selected match
    pub fn determine_measured_error(&self, filter: &ResultFilter, top_x: usize) -> MeasuredError {
        let mut errors = MeasuredError::default();
        for (_, _, entry) in self.extract_results(filter) {
            let rt = entry.rt.round_ties_even() as i64;
            let mut peaks: Vec<&MatchedPeak> = entry.peaks.iter().collect();
            peaks.sort_by(|a, b| b.relative_abundance.total_cmp(&a.relative_abundance));
            for peak in peaks.into_iter().take(top_x) {
                let (Some(mmz), Some(mi)) = (peak.measured_mz, peak.measured_intensity) else {
                    continue;
                };
                let si = peak.calculated_intensity * entry.scaling_factor;
                if si <= 0.0 || peak.calculated_mz <= 0.0 {
                    continue;
                }
                let intensity_error = ((mi - si).abs() / si).min(1.0);
                let mz_error = (mmz - peak.calculated_mz) / peak.calculated_mz * 1e6;
                errors.mz_error.push(mz_error);
                errors.intensity_error.push(intensity_error);
                errors
                    .time_dependent_mz_error
                    .entry(rt)
                    .or_default()
                    .push(mz_error);
                errors
                    .time_dependent_intensity_error
                    .entry(rt)
                    .or_default()
                    .push(intensity_error);
            }
        }
        errors
    }

    /// Sum the amounts of all matches binned by the enrichment of `element` and
    /// the score, both rounded to three decimals
    pub fn determine_label_efficiency(&self, element: &str) -> Vec<LabelEfficiencyBin> {
        let thousandths = |v: f64| (v * 1000.0).round() as i64;
        let mut bins: BTreeMap<(i64, i64), LabelEfficiencyBin> = BTreeMap::new();
        for (key, entry) in self.entries.iter() {
            let Some(percentile) = key
                .label_percentiles
                .get(element)
                .and_then(|p| p.parse::<f64>().ok())
            else {
                continue;
            };
            let percentile = thousandths(percentile);
            for m in entry.data.iter() {
                let score = thousandths(m.score);
                let bin = bins
                    .entry((percentile, score))
                    .or_insert_with(|| LabelEfficiencyBin {
                        percentile: percentile as f64 / 1000.0,
                        mscore: score as f64 / 1000.0,
                        count: 0.0,
                    });
                bin.count += m.scaling_factor;
            }
        }
        bins.into_values().collect()
    }

    /// Pair the unlabeled and 99% 15N labeled keys of every formula, file and charge
    pub fn group_14n_15n_pairs(&self) -> Vec<(MatchKey, MatchKey)> {
        let light = LabelPercentiles::from_iter([("N", format_percentile(0.0))]);
        let heavy = LabelPercentiles::from_iter([("N", format_percentile(0.99))]);
        self.entries
            .keys()
            .filter(|key| key.label_percentiles == light)
            .filter_map(|light_key| {
                let heavy_key = MatchKey {
                    label_percentiles: heavy.clone(),
                    ..light_key.clone()
                };
                self.contains_key(&heavy_key)
                    .then(|| (light_key.clone(), heavy_key))
            })
            .collect()
    }

    /// Pair fixed label variants with their counterparts in which every residue
    /// state `source` is replaced by `target`, e.g. `("R0", "R1")`.
    ///
    /// Variants already holding a target state are not paired, nor are variants
    /// without a source state.
    pub fn group_silac_pairs(&self, silac_pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        let targets: Vec<String> = silac_pairs.iter().map(|(_, t)| t.to_uppercase()).collect();
        let sources: Vec<String> = silac_pairs.iter().map(|(s, _)| s.to_uppercase()).collect();
        let mut pairs = Vec::new();
        for variants in self.lookup.molecule_fixed_label_variations.values() {
            for variant in variants.iter() {
                if targets.iter().any(|t| variant.contains(t.as_str())) {
                    continue;
                }
                if !sources.iter().any(|s| variant.contains(s.as_str())) {
                    continue;
                }
                let mut flipped = variant.clone();
                for (source, target) in silac_pairs.iter() {
                    flipped = flip_residue_state(&flipped, source, target);
                }
                pairs.push((variant.clone(), flipped));
            }
        }
        pairs
    }

    /// Retention time windows per formula and molecule from the evidence lookup
    pub fn determine_rt_windows_from_evidence(
        &self,
        tolerance: f64,
    ) -> BTreeMap<String, BTreeMap<String, RtWindow>> {
        self.lookup
            .formula_to_evidences
            .iter()
            .map(|(formula, evidences)| (formula.clone(), curate_rt_windows(evidences, tolerance)))
            .collect()
    }

    /// One summary row per key and molecule, with retention time windows taken
    /// from the evidences of the molecule widened by `tolerance`
    pub fn rt_info_rows(&self, tolerance: f64) -> Vec<RtInfoRow> {
        let windows = self.determine_rt_windows_from_evidence(tolerance);
        let mut rows = Vec::new();
        for key in self.entries.keys() {
            let base = RtInfoRow {
                file_name: key.file_name.clone(),
                formula: key.formula.clone(),
                trivial_names: self
                    .lookup
                    .formula_to_trivial_names
                    .get(&key.formula)
                    .map(|names| names.iter().join(";"))
                    .unwrap_or_default(),
                label_percentiles: key.label_percentiles.to_string(),
                charge: key.charge,
                ..Default::default()
            };

            let evidences = self
                .lookup
                .formula_to_evidences
                .get(&key.formula)
                .filter(|e| !e.is_empty());
            let molecules: Vec<&str> = match evidences {
                Some(evidences) => evidences.keys().map(|s| s.as_str()).collect(),
                None => self
                    .lookup
                    .formula_to_molecules
                    .get(&key.formula)
                    .map(|m| m.iter().map(|s| s.as_str()).collect())
                    .unwrap_or_default(),
            };
            if molecules.is_empty() {
                rows.push(base);
                continue;
            }

            for molecule in molecules {
                let mut row = base.clone();
                row.molecule = molecule.to_string();
                if let Some(evidence) = evidences.and_then(|e| e.get(molecule)) {
                    let mut described: Vec<(f64, String)> = evidence
                        .evidences
                        .iter()
                        .filter_map(|e| {
                            let rt = e.rt?;
                            let text = match e.score {
                                Some(score) => format!("{score}@{rt}"),
                                None => rt.to_string(),
                            };
                            Some((rt, text))
                        })
                        .collect();
                    described.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                    row.evidences = described.into_iter().map(|(_, s)| s).join(";");

                    if let Some(window) = windows.get(&key.formula).and_then(|w| w.get(molecule)) {
                        row.start = Some(window.start(tolerance));
                        row.stop = Some(window.stop(tolerance));
                    }
                    if !evidence.trivial_names.is_empty() {
                        row.trivial_names = evidence.trivial_names.iter().join(";");
                    }
                }
                rows.push(row);
            }
        }
        rows
    }

    /// Write the retention time summary table. Windows can be edited by hand and
    /// fed back through [`Results::calc_amounts_from_rt_info_file`].
    pub fn write_rt_info_file<P: AsRef<Path>>(
        &self,
        path: P,
        tolerance: f64,
    ) -> Result<Vec<RtInfoRow>, MZQuantError> {
        let rows = self.rt_info_rows(tolerance);
        write_rt_info_rows(BufWriter::new(File::create(path.as_ref())?), &rows)?;
        info!(
            "Wrote {} retention time windows to {}",
            rows.len(),
            path.as_ref().display()
        );
        Ok(rows)
    }

    /// Fill in the amount columns of rows with a retention time window from the
    /// matches inside that window, using `amount_fn` to condense each profile
    pub fn calc_amounts_from_rt_info<F>(&self, mut rows: Vec<RtInfoRow>, amount_fn: F) -> Vec<RtInfoRow>
    where
        F: Fn(&ElutionProfile) -> Option<Amount>,
    {
        for row in rows.iter_mut() {
            let (Some(start), Some(stop)) = (row.start, row.stop) else {
                continue;
            };
            let label_percentiles = match row.label_percentiles.parse::<LabelPercentiles>() {
                Ok(lp) => lp,
                Err(e) => {
                    warn!("Skipping row of {}: {e}", row.formula);
                    continue;
                }
            };
            let key = MatchKey::new(
                row.file_name.as_str(),
                row.formula.as_str(),
                row.charge,
                label_percentiles,
            );
            let Some(entry) = self.entries.get(&key) else {
                debug!("No matches for {key:?}");
                continue;
            };
            let mut in_window: Vec<&Match> = entry
                .data
                .iter()
                .filter(|m| m.rt >= start && m.rt <= stop)
                .collect();
            in_window.sort_by(|a, b| a.rt.total_cmp(&b.rt));
            let mut profile = ElutionProfile::default();
            for m in in_window {
                profile.push(m);
            }
            if let Some(amount) = amount_fn(&profile) {
                row.update_amount(&amount);
            }
        }
        rows
    }

    /// Read a retention time summary table, compute amounts within its windows and
    /// write it back in place
    pub fn calc_amounts_from_rt_info_file<P: AsRef<Path>, F>(
        &self,
        path: P,
        amount_fn: F,
    ) -> Result<Vec<RtInfoRow>, MZQuantError>
    where
        F: Fn(&ElutionProfile) -> Option<Amount>,
    {
        let rows = read_rt_info_rows(BufReader::new(File::open(path.as_ref())?))?;
        let rows = self.calc_amounts_from_rt_info(rows, amount_fn);
        write_rt_info_rows(BufWriter::new(File::create(path.as_ref())?), &rows)?;
        Ok(rows)
    }

    /// Write every match as one row, repeated for each molecule of the formula
    pub fn write_result_csv_to<W: Write>(&self, writer: W) -> Result<(), MZQuantError> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        for (key, entry) in self.entries.iter() {
            let evidences = self.lookup.formula_to_evidences.get(&key.formula);
            let molecules: Vec<Option<&str>> = match self.lookup.formula_to_molecules.get(&key.formula) {
                Some(molecules) if !molecules.is_empty() => {
                    molecules.iter().map(|m| Some(m.as_str())).collect()
                }
                _ => vec![None],
            };
            let label_percentiles = key.label_percentiles.to_string();
            for m in entry.data.iter() {
                for molecule in molecules.iter().copied() {
                    let trivial_names = molecule
                        .and_then(|name| evidences.and_then(|e| e.get(name)))
                        .filter(|e| !e.trivial_names.is_empty())
                        .map(|e| e.trivial_names.iter().join(";"))
                        .or_else(|| {
                            self.lookup
                                .formula_to_trivial_names
                                .get(&key.formula)
                                .map(|names| names.iter().join(";"))
                        });
                    csv_writer.serialize(ResultCsvRow {
                        formula: &key.formula,
                        molecule,
                        charge: key.charge,
                        scan_id: &m.spec_id,
                        label_percentiles: label_percentiles.clone(),
                        intensity: m.scaling_factor,
                        retention_time: m.rt,
                        score: m.score,
                        file_name: &key.file_name,
                        trivial_names,
                        expected_peaks: m.peaks.len(),
                        observed_peaks: m.observed_peaks(),
                    })?;
                }
            }
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn write_result_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), MZQuantError> {
        self.write_result_csv_to(BufWriter::new(File::create(path.as_ref())?))?;
        info!(
            "Wrote {} matches to {}",
            self.num_matches(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Write a peptide level mzTab summary: one `PEP` row per key and molecule
    /// with a retention time window, holding the maximum intensity within that
    /// window as the abundance of the file's assay.
    ///
    /// Windows come from the evidence lookup, widened by `rt_border_tolerance`
    /// minutes. `meta_info` adds numbered `MTD` lines, e.g. `fixed_mod` becomes
    /// `fixed_mod[1]`, while a key with a suffix like `study_variable-description`
    /// is numbered before the suffix. Without an `ms_run-location` entry, every
    /// matched file becomes a run.
    pub fn write_result_mztab_to<W: Write>(
        &self,
        mut writer: W,
        meta_info: &MzTabMetaInfo,
        rt_border_tolerance: f64,
    ) -> Result<(), MZQuantError> {
        if self.lookup.formula_to_evidences.is_empty() {
            warn!("No evidences are known, the mzTab file will not contain any peptides");
        }
        let ms_runs: Vec<String> = match meta_info.get(MZTAB_MS_RUN_LOCATION) {
            Some(runs) => runs.clone(),
            None => self.file_names().into_iter().map(String::from).collect(),
        };

        for line in MZTAB_HEADER {
            writeln!(writer, "{line}")?;
        }
        for i in 1..=ms_runs.len() {
            writeln!(writer, "MTD\tassay[{i}]-ms_run_ref\tms_run[{i}]")?;
        }
        if !meta_info.contains_key(MZTAB_MS_RUN_LOCATION) {
            for (i, run) in ms_runs.iter().enumerate() {
                writeln!(writer, "MTD\tms_run[{}]-location\t{run}", i + 1)?;
            }
        }
        for (key, values) in meta_info.iter() {
            let (name, suffix) = match key.split_once('-') {
                Some((name, definition)) => (name, format!("-{definition}")),
                None => (key.as_str(), String::new()),
            };
            for (i, value) in values.iter().enumerate() {
                writeln!(writer, "MTD\t{name}[{}]{suffix}\t{value}", i + 1)?;
            }
        }
        writeln!(writer)?;

        let mut tsv_writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .terminator(csv::Terminator::CRLF)
            .from_writer(writer);
        let mut header: Vec<String> = MZTAB_PEPTIDE_COLUMNS.iter().map(|c| c.to_string()).collect();
        header.extend(
            (1..=ms_runs.len()).map(|i| format!("peptide_abundance_assay[{i}]")),
        );
        tsv_writer.write_record(&header)?;

        let rows = self.calc_amounts_from_rt_info(
            self.rt_info_rows(rt_border_tolerance),
            determine_max_intensity,
        );
        let mut written = 0usize;
        for row in rows.iter() {
            let (Some(start), Some(stop), Some(max_intensity)) =
                (row.start, row.stop, row.max_intensity)
            else {
                continue;
            };
            let (sequence, modifications) = match row.molecule.split_once('#') {
                Some((sequence, modifications)) => (sequence, modifications),
                None => (row.molecule.as_str(), MZTAB_NULL),
            };
            let mut record = vec![
                "PEP".to_string(),
                sequence.to_string(),
                MZTAB_NULL.to_string(),
                modifications.to_string(),
                row.max_intensity_rt
                    .map_or_else(|| MZTAB_NULL.to_string(), |rt| rt.to_string()),
                format!("{:.2}|{:.2}", start * 60.0, stop * 60.0),
                row.charge.to_string(),
                MZTAB_NULL.to_string(),
            ];
            if !ms_runs.contains(&row.file_name) {
                debug!("{} is not a listed ms_run, abundance left empty", row.file_name);
            }
            record.extend(ms_runs.iter().map(|run| {
                if *run == row.file_name {
                    max_intensity.to_string()
                } else {
                    MZTAB_NULL.to_string()
                }
            }));
            tsv_writer.write_record(&record)?;
            written += 1;
        }
        tsv_writer.flush()?;
        debug!("Wrote {written} mzTab peptide rows");
        Ok(())
    }

    pub fn write_result_mztab<P: AsRef<Path>>(
        &self,
        path: P,
        meta_info: &MzTabMetaInfo,
        rt_border_tolerance: f64,
    ) -> Result<(), MZQuantError> {
        let mut handle = BufWriter::new(File::create(path.as_ref())?);
        self.write_result_mztab_to(&mut handle, meta_info, rt_border_tolerance)?;
        handle.flush()?;
        info!("Wrote mzTab summary to {}", path.as_ref().display());
        Ok(())
    }

    pub fn to_json_writer<W: Write>(&self, writer: W) -> Result<(), MZQuantError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self, MZQuantError> {
        let mut results: Results = serde_json::from_reader(reader)?;
        results.rebuild_index();
        Ok(results)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), MZQuantError> {
        let mut handle = BufWriter::new(File::create(path)?);
        self.to_json_writer(&mut handle)?;
        handle.flush()?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, MZQuantError> {
        Self::from_json_reader(BufReader::new(File::open(path)?))
    }

    fn rebuild_index(&mut self) {
        let mut index = ResultIndex::default();
        if self.params.build_result_index {
            for key in self.entries.keys() {
                index.insert(key);
            }
        }
        self.index = index;
    }

    fn file_names(&self) -> BTreeSet<&str> {
        self.entries.keys().map(|k| k.file_name.as_str()).collect()
    }
}

/// Replace each residue `source` (amino acid followed by a state, e.g. `R0`) with
/// `target`, absorbing any run of state characters after the residue
fn flip_residue_state(variant: &str, source: &str, target: &str) -> String {
    let mut source_chars = source.chars();
    let Some(source_aa) = source_chars.next() else {
        return variant.to_string();
    };
    let source_aa = source_aa.to_ascii_uppercase();
    let source_state: Vec<char> = source_chars.collect();
    let mut target_chars = target.chars();
    let target_residue: String = match target_chars.next() {
        Some(aa) => std::iter::once(aa.to_ascii_uppercase())
            .chain(target_chars)
            .collect(),
        None => return variant.to_string(),
    };

    let mut flipped = String::with_capacity(variant.len());
    let mut chars = variant.chars().peekable();
    while let Some(c) = chars.next() {
        if c != source_aa {
            flipped.push(c);
            continue;
        }
        while chars.next_if(|n| source_state.contains(n)).is_some() {}
        flipped.push_str(&target_residue);
    }
    flipped
}

pub fn write_rt_info_rows<W: Write>(writer: W, rows: &[RtInfoRow]) -> Result<(), MZQuantError> {
    let mut csv_writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(writer);
    for row in rows {
        csv_writer.serialize(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn read_rt_info_rows<R: io::Read>(reader: R) -> Result<Vec<RtInfoRow>, MZQuantError> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let mut rows = Vec::new();
    for row in csv_reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

pub fn read_rt_info_file<P: AsRef<Path>>(path: P) -> Result<Vec<RtInfoRow>, MZQuantError> {
    read_rt_info_rows(BufReader::new(File::open(path)?))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::evidence::Evidence;

    const DDSPDLPK: &str = "C(37)H(59)N(9)O(16)";
    const CCTESLVNR: &str = "C(43)H(75)N(15)O(17)S(2)";
    const CCTESLVNR_MOLECULE: &str = "CCTESLVNR#Carbamidomethyl:1;Carbamidomethyl:2";

    fn lp(text: &str) -> LabelPercentiles {
        text.parse().unwrap()
    }

    fn fixture() -> Results {
        let mut lookup = Lookup::default();
        for (formula, molecule) in [(DDSPDLPK, "DDSPDLPK"), (CCTESLVNR, CCTESLVNR_MOLECULE)] {
            lookup
                .molecule_to_formula
                .insert(molecule.to_string(), formula.to_string());
            lookup
                .formula_to_molecules
                .entry(formula.to_string())
                .or_default()
                .insert(molecule.to_string());
        }
        let mut results = Results::new(Params::default(), lookup);
        let peak = |mz: f64, i: f64| vec![MatchedPeak::new(Some(mz), Some(i), 1.0, mz, 1.0)];
        results.add(
            MatchKey::new("BSA1.mzML", DDSPDLPK, 2, lp("N:0.000")),
            Match::new("1337", 13.37, 1.0, 100.0, peak(443.7112649, 100.0)),
        );
        results.add(
            MatchKey::new("BSA1.mzML", DDSPDLPK, 2, lp("N:0.000")),
            Match::new("1338", 13.38, 0.9, 100.0, peak(443.7112649, 100.0)),
        );
        results.add(
            MatchKey::new("BSA2.mzML", CCTESLVNR, 3, lp("N:0.010")),
            Match::new("1337", 13.37, 1.0, 10.0, peak(569.7526156, 10.0)),
        );
        results
    }

    #[test]
    fn test_add_tracks_best() {
        let results = fixture();
        assert_eq!(results.len(), 2);
        assert_eq!(results.num_matches(), 3);
        let entry = results
            .get(&MatchKey::new("BSA1.mzML", DDSPDLPK, 2, lp("N:0.000")))
            .unwrap();
        assert_eq!(entry.len_data, 2);
        assert_eq!(entry.max_score, 1.0);
        assert_eq!(entry.best().unwrap().spec_id, "1337");
        assert_eq!(results.index().files.len(), 2);
        assert_eq!(results.index().charges.len(), 2);
    }

    #[test]
    fn test_filters() {
        let results = fixture();
        let count = |filter: ResultFilter| results.parse_and_filter(&filter).count();
        assert_eq!(count(ResultFilter::new()), 2);
        assert_eq!(count(ResultFilter::new().molecules(["DDSPDLPK"])), 1);
        assert_eq!(count(ResultFilter::new().molecules(["UNKNOWN"])), 0);
        assert_eq!(count(ResultFilter::new().charges([3])), 1);
        assert_eq!(count(ResultFilter::new().file_names(["BSA2.mzML"])), 1);
        assert_eq!(count(ResultFilter::new().formulas([DDSPDLPK, CCTESLVNR])), 2);
        assert_eq!(
            count(ResultFilter::new().label_percentiles([lp("N:0.010")])),
            1
        );
        assert_eq!(
            count(
                ResultFilter::new()
                    .molecules(["DDSPDLPK"])
                    .formulas([CCTESLVNR])
            ),
            2
        );
    }

    #[test]
    fn test_extract_results() {
        let results = fixture();
        let extracted: Vec<_> = results
            .extract_results(
                &ResultFilter::new()
                    .molecules(["DDSPDLPK"])
                    .score_threshold(0.95),
            )
            .collect();
        assert_eq!(extracted.len(), 1);
        let (key, i, entry) = extracted[0];
        assert_eq!(key.formula, DDSPDLPK);
        assert_eq!(i, 0);
        assert_eq!(entry.scaling_factor, 100.0);
        assert_eq!(entry.spec_id, "1337");

        let flat = results.format_all_results();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[2].file_name, "BSA2.mzML");
    }

    #[test]
    fn test_translate() {
        let results = fixture();
        let formulas = results.translate_molecules_to_formulas(&["DDSPDLPK", "PEPTIDE"][..], None);
        assert_eq!(formulas.into_iter().collect::<Vec<_>>(), vec![DDSPDLPK]);
        let formulas = results
            .translate_molecules_to_formulas(&[CCTESLVNR_MOLECULE][..], Some(&[DDSPDLPK.to_string()][..]));
        assert_eq!(formulas.len(), 2);
    }

    #[test]
    fn test_max_score() {
        let results = fixture();
        let (score, key, i, entry) = results
            .max_score(&ResultFilter::new().molecules(["DDSPDLPK"]))
            .unwrap();
        assert_eq!(score, 1.0);
        assert_eq!(key.charge, 2);
        assert_eq!(i, 0);
        assert_eq!(entry.scaling_factor, 100.0);
        assert!(results
            .max_score(&ResultFilter::new().molecules(["PEPTIDE"]))
            .is_none());
    }

    fn profile(rt: &[f64], intensity: &[f64], scores: &[f64]) -> ElutionProfile {
        ElutionProfile {
            rt: rt.to_vec(),
            intensity: intensity.to_vec(),
            scores: scores.to_vec(),
            spec_ids: (0..rt.len()).map(|i| i.to_string()).collect(),
        }
    }

    #[test]
    fn test_determine_max_intensity() {
        let p = profile(&[1.0, 2.0, 3.0, 4.0], &[1.0, 100.0, 200.0, 1.0], &[0.7, 0.8, 0.9, 1.0]);
        let amount = determine_max_intensity(&p).unwrap();
        assert_eq!(amount.max_intensity, 200.0);
        assert_eq!(amount.max_intensity_rt, 3.0);
        assert_eq!(amount.max_intensity_score, 0.9);
        assert!(amount.auc.is_none());
        assert!(determine_max_intensity(&ElutionProfile::default()).is_none());
    }

    #[test]
    fn test_calc_amount() {
        let cases = [
            (vec![0.0, 10.0, 100.0], 100.0, 3.0, 110.0, 60.0),
            (vec![10.0, 100.0, 100.0, 10.0], 100.0, 2.0, 220.0, 210.0),
            (vec![10.0, 100.0, 120.0, 10.0], 120.0, 3.0, 240.0, 230.0),
            (vec![10.0, 10.0, 10.0, 10.0], 10.0, 1.0, 40.0, 30.0),
        ];
        for (intensity, max_i, max_rt, sum, auc) in cases {
            let rt: Vec<f64> = (1..=intensity.len()).map(|x| x as f64).collect();
            let scores = vec![0.8; intensity.len()];
            let amount = calc_amount(&profile(&rt, &intensity, &scores)).unwrap();
            assert_eq!(amount.max_intensity, max_i);
            assert_eq!(amount.max_intensity_rt, max_rt);
            assert_eq!(amount.sum_intensity, Some(sum));
            assert_eq!(amount.auc, Some(auc));
        }
        assert!(calc_amount(&ElutionProfile::default()).is_none());
    }

    #[test]
    fn test_measured_error() {
        let results = fixture();
        let errors = results.determine_measured_error(&ResultFilter::new(), 3);
        assert_eq!(errors.mz_error, vec![0.0, 0.0, 0.0]);
        assert_eq!(errors.intensity_error, vec![0.0, 0.0, 0.0]);
        assert_eq!(errors.time_dependent_mz_error[&13].len(), 3);
    }

    #[test]
    fn test_label_efficiency() {
        let results = fixture();
        let bins = results.determine_label_efficiency("N");
        assert_eq!(bins.len(), 3);
        let natural_top = bins
            .iter()
            .find(|b| b.percentile == 0.0 && b.mscore == 1.0)
            .unwrap();
        assert_eq!(natural_top.count, 100.0);
        assert!(results.determine_label_efficiency("C").is_empty());
    }

    #[test]
    fn test_result_index_disabled() {
        let params = Params {
            build_result_index: false,
            ..Default::default()
        };
        let mut results = Results::new(params, Lookup::default());
        let peaks = vec![MatchedPeak::new(Some(500.0), Some(1.0), 1.0, 500.0, 1.0)];
        for percentile in ["N:0.000", "N:0.990"] {
            results.add(
                MatchKey::new("run1.mzML", DDSPDLPK, 2, lp(percentile)),
                Match::new("1", 10.0, 0.9, 1.0, peaks.clone()),
            );
        }
        assert_eq!(results.index(), &ResultIndex::default());
        assert_eq!(results.len(), 2);
        assert_eq!(results.group_14n_15n_pairs().len(), 1);

        let mut buffer = Vec::new();
        results.to_json_writer(&mut buffer).unwrap();
        let restored = Results::from_json_reader(buffer.as_slice()).unwrap();
        assert!(restored.index().files.is_empty());
    }

    #[test]
    fn test_14n_15n_pairs() {
        let mut results = Results::default();
        let peaks = vec![MatchedPeak::new(Some(500.0), Some(1.0), 1.0, 500.0, 1.0)];
        for percentile in ["N:0.000", "N:0.990"] {
            results.add(
                MatchKey::new("run1.mzML", DDSPDLPK, 2, lp(percentile)),
                Match::new("1", 10.0, 0.9, 1.0, peaks.clone()),
            );
        }
        results.add(
            MatchKey::new("run1.mzML", CCTESLVNR, 2, lp("N:0.000")),
            Match::new("1", 10.0, 0.9, 1.0, peaks.clone()),
        );
        let pairs = results.group_14n_15n_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.label_percentiles, lp("N:0.000"));
        assert_eq!(pairs[0].1.label_percentiles, lp("N:0.990"));
    }

    #[test]
    fn test_silac_pairs() {
        let mut lookup = Lookup::default();
        lookup.molecule_fixed_label_variations.insert(
            "ORGINAL_MOLECULE".to_string(),
            ["R0_C1_R0", "R0_C0_R0", "K0_C1_K0", "K1_C0_K1", "R0_C1_R1", "R1_C1_R1"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        let results = Results::new(Params::default(), lookup);
        let pair = |a: &str, b: &str| (a.to_string(), b.to_string());
        let cases: Vec<(Vec<(&str, &str)>, Vec<(String, String)>)> = vec![
            (
                vec![("R0", "R1")],
                vec![pair("R0_C0_R0", "R1_C0_R1"), pair("R0_C1_R0", "R1_C1_R1")],
            ),
            (vec![("K0", "K1")], vec![pair("K0_C1_K0", "K1_C1_K1")]),
            (vec![("k0", "K1")], vec![pair("K0_C1_K0", "K1_C1_K1")]),
            (
                vec![("R0", "R1"), ("K0", "K1")],
                vec![
                    pair("K0_C1_K0", "K1_C1_K1"),
                    pair("R0_C0_R0", "R1_C0_R1"),
                    pair("R0_C1_R0", "R1_C1_R1"),
                ],
            ),
            (
                vec![("R0", "R1"), ("K1", "K0")],
                vec![
                    pair("K1_C0_K1", "K0_C0_K0"),
                    pair("R0_C0_R0", "R1_C0_R1"),
                    pair("R0_C1_R0", "R1_C1_R1"),
                ],
            ),
        ];
        for (silac_pairs, expected) in cases {
            let mut pairs = results.group_silac_pairs(&silac_pairs);
            pairs.sort();
            assert_eq!(pairs, expected, "{silac_pairs:?}");
        }
    }

    #[test]
    fn test_smooth_list() {
        let cases: [(&[f64], usize, Vec<f64>); 4] = [
            (
                &[0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0],
                1,
                vec![0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0],
            ),
            (
                &[0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0],
                2,
                vec![0.5, 1.5, 3.0, 3.5, 3.0, 1.5, 0.5],
            ),
            (
                &[2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0],
                3,
                vec![1.0, 5.0 / 3.0, 4.0 / 3.0, 5.0 / 3.0, 4.0 / 3.0, 5.0 / 3.0, 1.0],
            ),
            (
                &[0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0],
                5,
                vec![0.6, 1.2, 1.6, 1.8, 1.6, 1.2, 0.6],
            ),
        ];
        for (input, k, expected) in cases {
            let smoothed = smooth_list(input, k);
            assert_eq!(smoothed.len(), expected.len());
            for (a, b) in smoothed.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-9, "{smoothed:?} != {expected:?} at k={k}");
            }
        }
    }

    fn evidence_windows(windows: &[(&str, f64, f64)]) -> BTreeMap<String, MoleculeEvidence> {
        windows
            .iter()
            .map(|(name, start, end)| {
                let evidences = [start, end]
                    .into_iter()
                    .map(|rt| Evidence {
                        rt: Some(*rt),
                        ..Default::default()
                    })
                    .collect();
                (
                    name.to_string(),
                    MoleculeEvidence {
                        evidences,
                        trivial_names: BTreeSet::new(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_curate_rt_windows() {
        let single = curate_rt_windows(&evidence_windows(&[("p1", 2.0, 4.0)]), 1.0);
        assert_eq!(single["p1"], RtWindow::new(2.0, 4.0));

        let overlapping =
            curate_rt_windows(&evidence_windows(&[("p1", 2.0, 4.0), ("p2", 3.0, 5.0)]), 1.0);
        assert_eq!(overlapping["p1"].rt_window, (2.0, 4.0));
        assert_eq!(overlapping["p1"].upper_window_border, Some(-0.5));
        assert_eq!(overlapping["p1"].lower_window_border, None);
        assert_eq!(overlapping["p2"].lower_window_border, Some(-0.5));
        assert_eq!(overlapping["p2"].start(1.0), 3.5);
        assert_eq!(overlapping["p1"].stop(1.0), 3.5);

        let chained = curate_rt_windows(
            &evidence_windows(&[("p1", 2.0, 4.0), ("p2", 3.0, 5.0), ("p3", 4.0, 6.0)]),
            1.0,
        );
        assert_eq!(chained["p2"].lower_window_border, Some(-0.5));
        assert_eq!(chained["p2"].upper_window_border, Some(-0.5));
        assert_eq!(chained["p3"].lower_window_border, Some(-0.5));

        let close = curate_rt_windows(&evidence_windows(&[("p1", 2.0, 3.0), ("p2", 4.0, 5.0)]), 1.0);
        assert_eq!(close["p1"].upper_window_border, Some(0.5));
        assert_eq!(close["p2"].lower_window_border, Some(0.5));

        let nested = curate_rt_windows(&evidence_windows(&[("p1", 1.0, 10.0), ("p2", 4.0, 5.0)]), 1.0);
        assert!(nested["p1"].window_is_unseparable);
        assert!(nested["p2"].window_is_unseparable);
        assert_eq!(nested["p2"].lower_window_border, None);
    }

    fn fixture_with_evidence() -> Results {
        let mut results = fixture();
        let mut evidences = evidence_windows(&[("DDSPDLPK", 13.0, 13.5)]);
        if let Some(e) = evidences.get_mut("DDSPDLPK") {
            e.evidences[0].score = Some(0.01);
            e.trivial_names.insert("BSA".to_string());
        }
        results
            .lookup
            .formula_to_evidences
            .insert(DDSPDLPK.to_string(), evidences);
        results
    }

    #[test]
    fn test_rt_info_rows_and_amounts() {
        let results = fixture_with_evidence();
        let rows = results.rt_info_rows(0.5);
        assert_eq!(rows.len(), 2);
        let ddsp = &rows[0];
        assert_eq!(ddsp.molecule, "DDSPDLPK");
        assert_eq!(ddsp.start, Some(12.5));
        assert_eq!(ddsp.stop, Some(14.0));
        assert_eq!(ddsp.evidences, "0.01@13;13.5");
        assert_eq!(ddsp.trivial_names, "BSA");
        assert_eq!(rows[1].molecule, CCTESLVNR_MOLECULE);
        assert_eq!(rows[1].start, None);

        let rows = results.calc_amounts_from_rt_info(rows, calc_amount);
        assert_eq!(rows[0].max_intensity, Some(100.0));
        assert_eq!(rows[0].max_intensity_rt, Some(13.37));
        assert_eq!(rows[0].sum_intensity, Some(200.0));
        assert_eq!(rows[1].max_intensity, None);

        let mut buffer = Vec::new();
        write_rt_info_rows(&mut buffer, &rows).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("file_name,formula,molecule,trivial_name(s),label_percentiles,charge,start (min)"));
        let reread = read_rt_info_rows(buffer.as_slice()).unwrap();
        assert_eq!(reread, rows);
    }

    #[test]
    fn test_write_result_csv() {
        let results = fixture_with_evidence();
        let mut buffer = Vec::new();
        results.write_result_csv_to(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "formula,molecule,charge,scan_id,label_percentiles,intensity,retention_time,mScore,file_name,trivial_name(s),#exp. peaks,#obs. peaks"
        );
        assert!(lines[1].contains("DDSPDLPK"));
        assert!(lines[1].contains(",BSA,1,1"));
    }

    #[test]
    fn test_write_result_mztab() {
        let results = fixture_with_evidence();
        let mut buffer = Vec::new();
        results
            .write_result_mztab_to(&mut buffer, &MzTabMetaInfo::new(), 0.0)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "MTD\tmzTab-version\t1.0.0");
        assert!(lines.contains(&"MTD\tassay[2]-ms_run_ref\tms_run[2]"));
        assert!(lines.contains(&"MTD\tms_run[1]-location\tBSA1.mzML"));
        assert!(lines.contains(&"MTD\tms_run[2]-location\tBSA2.mzML"));
        assert_eq!(
            lines[lines.len() - 2],
            "PEH\tsequence\taccession\tmodifications\tretention_time\tretention_time_window\tcharge\tmass_to_charge\tpeptide_abundance_assay[1]\tpeptide_abundance_assay[2]"
        );
        assert_eq!(
            lines[lines.len() - 1],
            "PEP\tDDSPDLPK\tnull\tnull\t13.37\t780.00|810.00\t2\tnull\t100\tnull"
        );
    }

    #[test]
    fn test_write_result_mztab_meta_info() {
        let results = fixture_with_evidence();
        let meta_info: MzTabMetaInfo = [
            ("fixed_mod", "[UNIMOD, UNIMOD:4, Carbamidomethyl, ]"),
            ("study_variable-description", "Standard BSA measurement"),
            ("ms_run-location", "BSA1.mzML"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
        .collect();
        let mut buffer = Vec::new();
        results
            .write_result_mztab_to(&mut buffer, &meta_info, 0.5)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"MTD\tfixed_mod[1]\t[UNIMOD, UNIMOD:4, Carbamidomethyl, ]"));
        assert!(lines.contains(&"MTD\tstudy_variable[1]-description\tStandard BSA measurement"));
        assert!(lines.contains(&"MTD\tms_run[1]-location\tBSA1.mzML"));
        assert!(!lines.iter().any(|l| l.contains("ms_run[2]")));
        assert_eq!(
            lines[lines.len() - 1],
            "PEP\tDDSPDLPK\tnull\tnull\t13.37\t750.00|840.00\t2\tnull\t100"
        );
    }

    #[test]
    fn test_json_round_trip() {
        let results = fixture();
        let mut buffer = Vec::new();
        results.to_json_writer(&mut buffer).unwrap();
        let restored = Results::from_json_reader(buffer.as_slice()).unwrap();
        assert_eq!(restored.len(), results.len());
        assert_eq!(restored.num_matches(), 3);
        assert_eq!(restored.index().formulas, results.index().formulas);
        assert_eq!(restored.lookup.molecule_to_formula, results.lookup.molecule_to_formula);
        let key = MatchKey::new("BSA1.mzML", DDSPDLPK, 2, lp("N:0.000"));
        assert_eq!(restored.get(&key).unwrap().best().unwrap().spec_id, "1337");
    }

    #[test]
    fn test_merge() {
        let mut results = fixture();
        let other = fixture();
        results.merge(other);
        assert_eq!(results.len(), 2);
        assert_eq!(results.num_matches(), 6);
    }

    #[test]
    fn test_merge_orders_by_rt() {
        let key = MatchKey::new("run1.mzML", DDSPDLPK, 2, lp("N:0.000"));
        let peaks = vec![MatchedPeak::new(Some(500.0), Some(1.0), 1.0, 500.0, 1.0)];
        let partial = |matches: &[(&str, f64, f64, f64)]| {
            let mut results = Results::default();
            for (spec_id, rt, score, intensity) in matches.iter().copied() {
                results.add(
                    key.clone(),
                    Match::new(spec_id, rt, score, intensity, peaks.clone()),
                );
            }
            results
        };

        let mut results = partial(&[("2", 2.0, 0.9, 20.0), ("4", 4.0, 0.8, 10.0)]);
        results.merge(partial(&[("1", 1.0, 0.9, 10.0), ("3", 3.0, 0.7, 10.0)]));
        let entry = results.get(&key).unwrap();
        let rts: Vec<f64> = entry.data.iter().map(|m| m.rt).collect();
        assert_eq!(rts, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(entry.len_data, 4);
        assert_eq!(entry.max_score_index, Some(0));
        assert_eq!(entry.best().unwrap().spec_id, "1");

        let mut rows = results.rt_info_rows(0.5);
        rows[0].start = Some(0.0);
        rows[0].stop = Some(5.0);
        let rows = results.calc_amounts_from_rt_info(rows, calc_amount);
        assert_eq!(rows[0].auc, Some(40.0));
        assert_eq!(rows[0].max_intensity_rt, Some(2.0));
    }
}
