//! Isotope pattern match scoring
use serde::{Deserialize, Serialize};

use crate::params::Params;

pub type ScoreType = f64;

/// A theoretical peak paired with the measured peak assigned to it, if any
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPeak {
    pub measured_mz: Option<f64>,
    pub measured_intensity: Option<f64>,
    pub relative_abundance: f64,
    pub calculated_mz: f64,
    pub calculated_intensity: f64,
}

impl MatchedPeak {
    pub fn new(
        measured_mz: Option<f64>,
        measured_intensity: Option<f64>,
        relative_abundance: f64,
        calculated_mz: f64,
        calculated_intensity: f64,
    ) -> Self {
        Self {
            measured_mz,
            measured_intensity,
            relative_abundance,
            calculated_mz,
            calculated_intensity,
        }
    }

    /// A theoretical peak without a measured counterpart
    pub fn unmatched(relative_abundance: f64, calculated_mz: f64, calculated_intensity: f64) -> Self {
        Self::new(
            None,
            None,
            relative_abundance,
            calculated_mz,
            calculated_intensity,
        )
    }

    pub fn is_matched(&self) -> bool {
        self.measured_mz.is_some()
    }
}

pub trait IsotopicPatternScorer {
    /// Score a set of matched peaks, returning the score and the factor scaling
    /// calculated intensities to measured ones
    fn score(&self, peaks: &[MatchedPeak]) -> (ScoreType, f64);
}

/// The mScore, a Gower style similarity of m/z and intensity errors.
///
/// ```math
/// \begin{split}
///     \sigma &= \frac{\sum_k m^{i}_k r_k}{\sum_k c^{i}_k r_k} \\
///     s^{mz}_k &= 1 - \frac{|m^{mz}_k - c^{mz}_k|}{c^{mz}_k \alpha} \\
///     s^{i}_k &= 1 - \frac{|m^{i}_k - \sigma c^{i}_k|}{\sigma c^{i}_k (1 + \omega - r_k)} \\
///     S &= \xi \frac{\sum_k s^{mz}_k r_k}{\sum_k r_k} + (1 - \xi) \frac{\sum_k s^{i}_k r_k}{\sum_k r_k}
/// \end{split}
/// ```
///
/// where $`\alpha`$ is the relative m/z tolerance, $`\omega`$ the relative intensity
/// tolerance of the most abundant peak and $`\xi`$ the m/z score weight. Peak scores
/// are clamped at zero, and peaks with $`r_k`$ below the matching threshold are not
/// considered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MScoreScorer {
    pub mz_score_percentile: f64,
    pub rel_mz_range: f64,
    pub rel_i_range: f64,
    pub min_relative_abundance: f64,
}

impl MScoreScorer {
    pub fn new(
        mz_score_percentile: f64,
        rel_mz_range: f64,
        rel_i_range: f64,
        min_relative_abundance: f64,
    ) -> Self {
        Self {
            mz_score_percentile,
            rel_mz_range,
            rel_i_range,
            min_relative_abundance,
        }
    }

    pub fn from_params(params: &Params) -> Self {
        Self::new(
            params.mz_score_percentile,
            params.rel_mz_range,
            params.rel_i_range,
            params.min_rel_peak_intensity_for_matching,
        )
    }

    fn considered<'a>(&self, peaks: &'a [MatchedPeak]) -> impl Iterator<Item = &'a MatchedPeak> {
        let threshold = self.min_relative_abundance;
        peaks
            .iter()
            .filter(move |p| p.relative_abundance >= threshold)
    }

    pub fn scaling_factor(&self, peaks: &[MatchedPeak]) -> f64 {
        let (measured, calculated) = self
            .considered(peaks)
            .filter_map(|p| {
                p.measured_intensity.map(|mi| {
                    (
                        mi * p.relative_abundance,
                        p.calculated_intensity * p.relative_abundance,
                    )
                })
            })
            .fold((0.0, 0.0), |(m, c), (mi, ci)| (m + mi, c + ci));
        if calculated == 0.0 {
            0.0
        } else {
            measured / calculated
        }
    }

    pub fn score(&self, peaks: &[MatchedPeak]) -> (ScoreType, f64) {
        let ri_sum: f64 = self.considered(peaks).map(|p| p.relative_abundance).sum();
        let has_calculated = self
            .considered(peaks)
            .any(|p| p.is_matched() && p.calculated_intensity * p.relative_abundance != 0.0);
        if ri_sum == 0.0 || !has_calculated {
            return (0.0, 0.0);
        }
        let scaling = self.scaling_factor(peaks);

        let mut mz_score = 0.0;
        let mut i_score = 0.0;
        for peak in self.considered(peaks) {
            let (Some(mmz), Some(mi)) = (peak.measured_mz, peak.measured_intensity) else {
                continue;
            };
            let ri = peak.relative_abundance;
            if peak.calculated_mz > f64::EPSILON {
                let error = (mmz - peak.calculated_mz).abs() / peak.calculated_mz;
                if error <= self.rel_mz_range {
                    mz_score += (1.0 - error / self.rel_mz_range) * ri;
                }
            }
            let si = peak.calculated_intensity * scaling;
            if si > f64::EPSILON {
                let error = (mi - si).abs() / si;
                let range = 1.0 + self.rel_i_range - ri;
                if error <= range {
                    i_score += (1.0 - error / range) * ri;
                }
            }
        }
        let score = self.mz_score_percentile * mz_score / ri_sum
            + (1.0 - self.mz_score_percentile) * i_score / ri_sum;
        (score, scaling)
    }
}

impl Default for MScoreScorer {
    fn default() -> Self {
        Self::from_params(&Params::default())
    }
}

impl IsotopicPatternScorer for MScoreScorer {
    #[inline]
    fn score(&self, peaks: &[MatchedPeak]) -> (ScoreType, f64) {
        MScoreScorer::score(self, peaks)
    }
}
