use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tuning parameters shared by library construction, matching and result processing.
///
/// Keys are serialized in upper case so that configuration files can use the
/// conventional parameter names, e.g. `M_SCORE_THRESHOLD = 0.7`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Params {
    /// The minimum mScore a match must reach to be stored
    pub m_score_threshold: f64,
    /// Abundances of an element's isotope envelope at or below this are treated as zero
    pub element_min_abundance: f64,
    /// The minimum relative abundance a theoretical peak needs to be used for matching
    pub min_rel_peak_intensity_for_matching: f64,
    /// The fraction of matchable peaks that must overlap the spectrum
    pub required_percentile_peak_overlap: f64,
    pub minimum_number_of_matched_isotopologues: usize,
    pub intensity_transformation_factor: f64,
    pub upper_mz_limit: f64,
    pub lower_mz_limit: f64,
    /// Accepted so existing configurations load, matching bins m/z values by
    /// `internal_precision`
    pub mz_transformation_factor: f64,
    /// The relative m/z tolerance, 5e-6 is 5 ppm
    pub rel_mz_range: f64,
    pub rel_i_range: f64,
    /// The scale m/z values are multiplied by before rounding to integers
    pub internal_precision: f64,
    pub max_molecules_per_match_bin: usize,
    /// The weight of the m/z error in the mScore, the intensity error gets the rest
    pub mz_score_percentile: f64,
    /// Amino acids which must carry the same fixed label index in every molecule
    pub silac_aas_locked_in_experiment: Option<Vec<String>>,
    /// Whether results keep an index of the files, formulas, charges and label
    /// percentiles they have seen
    pub build_result_index: bool,
    pub machine_offset_in_ppm: f64,
    pub fixed_label_isotope_enrichment_levels: BTreeMap<String, f64>,
    /// Additional amino acid residues as unimod composition strings
    pub amino_acids: BTreeMap<String, String>,
    /// Additional modifications as unimod composition strings
    pub modifications: BTreeMap<String, String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            m_score_threshold: 0.5,
            element_min_abundance: 1e-3,
            min_rel_peak_intensity_for_matching: 0.01,
            required_percentile_peak_overlap: 0.5,
            minimum_number_of_matched_isotopologues: 2,
            intensity_transformation_factor: 1e5,
            upper_mz_limit: 2000.0,
            lower_mz_limit: 150.0,
            mz_transformation_factor: 1e4,
            rel_mz_range: 5e-6,
            rel_i_range: 0.2,
            internal_precision: 1000.0,
            max_molecules_per_match_bin: 20,
            mz_score_percentile: 0.4,
            silac_aas_locked_in_experiment: None,
            build_result_index: true,
            machine_offset_in_ppm: 0.0,
            fixed_label_isotope_enrichment_levels: [("15N", 0.994), ("13C", 0.996), ("2H", 0.994)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            amino_acids: BTreeMap::new(),
            modifications: BTreeMap::new(),
        }
    }
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// The enrichment used for a fixed label isotope without an explicit level
    pub const DEFAULT_FIXED_LABEL_ENRICHMENT: f64 = 0.994;

    pub fn fixed_label_enrichment(&self, isotope_key: &str) -> f64 {
        self.fixed_label_isotope_enrichment_levels
            .get(isotope_key)
            .copied()
            .unwrap_or(Self::DEFAULT_FIXED_LABEL_ENRICHMENT)
    }

    /// Convert an m/z value into the integer space used for set overlaps
    #[inline]
    pub fn transform_mz(&self, mz: f64) -> i64 {
        (mz * self.internal_precision).round_ties_even() as i64
    }
}

/// Format an enrichment level as it appears in label percentile keys, e.g. `"0.994"`
pub fn format_percentile(value: f64) -> String {
    format!("{:.3}", value)
}
