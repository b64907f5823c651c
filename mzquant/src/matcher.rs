//! Match the patterns of an [`IsotopologueLibrary`] against centroided spectra.
//!
//! Peaks are mapped into the integer m/z space of the library, so candidate
//! isotopologues can be pre-screened with set overlaps before any scoring.
use std::collections::HashMap;

use identity_hash::BuildIdentityHasher;
use itertools::Itertools;
use mzpeaks::prelude::*;
use mzpeaks::CentroidLike;
use tracing::trace;

use crate::library::{tmz_range, IsotopologueLibrary, TmzSet};
use crate::params::Params;
use crate::results::{Match, MatchKey, Results};
use crate::scorer::{IsotopicPatternScorer, MScoreScorer, MatchedPeak, ScoreType};

/// Measured `(m/z, intensity)` pairs grouped by transformed m/z
pub type SpectrumLookup = HashMap<i64, Vec<(f64, f64)>, BuildIdentityHasher<i64>>;

/// Neighbouring peaks kept on either side of a slice
pub const SLICE_TOLERANCE: usize = 2;

/// A spectrum in the transformed m/z space of a library
#[derive(Debug, Clone, Default)]
pub struct TransformedSpectrum {
    pub tmzs: TmzSet,
    pub lookup: SpectrumLookup,
}

impl TransformedSpectrum {
    pub fn len(&self) -> usize {
        self.tmzs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tmzs.is_empty()
    }

    /// The first measured peak mapped to `tmz`
    pub fn peak_at(&self, tmz: i64) -> Option<(f64, f64)> {
        self.lookup.get(&tmz).and_then(|peaks| peaks.first().copied())
    }
}

/// The best scoring assignment of measured peaks to one isotopologue
#[derive(Debug, Clone, PartialEq)]
pub struct IsotopologueMatch {
    pub score: ScoreType,
    pub scaling_factor: f64,
    pub peaks: Vec<MatchedPeak>,
}

impl IsotopologueMatch {
    pub fn matched_peak_count(&self) -> usize {
        self.peaks.iter().filter(|p| p.is_matched()).count()
    }
}

/// Select the peaks between `lower` and `upper`, each an `(m/z, intensity)` pair
/// compared lexicographically, widened by `tolerance` peaks on both ends.
///
/// `peaks` must be sorted by m/z.
pub fn slice_peaks<C: CentroidLike>(
    peaks: &[C],
    lower: (f64, f64),
    upper: (f64, f64),
    tolerance: usize,
) -> &[C] {
    let position = |(mz, intensity): (f64, f64)| {
        peaks.partition_point(|p| {
            let peak_mz = p.mz();
            peak_mz < mz || (peak_mz == mz && p.intensity() as f64 <= intensity)
        })
    };
    let start = position(lower).saturating_sub(tolerance);
    let end = (position(upper) + tolerance).min(peaks.len());
    if start >= end {
        &peaks[0..0]
    } else {
        &peaks[start..end]
    }
}

/// All transformed m/z values within the relative m/z tolerance of `mz`
pub fn transform_mz_to_set(mz: f64, params: &Params) -> TmzSet {
    tmz_range(mz, params).iter().collect()
}

/// Map peaks into the transformed m/z space, restricted to `mz_range` if given
pub fn transform_spectrum<C: CentroidLike>(
    peaks: &[C],
    mz_range: Option<(f64, f64)>,
    params: &Params,
) -> TransformedSpectrum {
    let peaks = match mz_range {
        Some((lower, upper)) => {
            slice_peaks(peaks, (lower, 0.001), (upper, 0.001), SLICE_TOLERANCE)
        }
        None => peaks,
    };
    let mut spectrum = TransformedSpectrum::default();
    for peak in peaks {
        let mz = peak.mz();
        let tmz = params.transform_mz(mz);
        spectrum.tmzs.insert(tmz);
        spectrum
            .lookup
            .entry(tmz)
            .or_default()
            .push((mz, peak.intensity() as f64));
    }
    spectrum
}

impl IsotopologueLibrary {
    /// An empty result collection sharing this library's parameters and lookups
    pub fn results(&self) -> Results {
        Results::new(self.params().clone(), self.lookup().clone())
    }

    /// Match the match entry at `index` against a transformed spectrum.
    ///
    /// Returns `None` when too few of the isotopologue's matchable peaks overlap
    /// the spectrum. Otherwise every combination of candidate peaks is scored and
    /// the best is returned, keeping the earliest combination among equals.
    pub fn match_isotopologue<S: IsotopicPatternScorer>(
        &self,
        index: usize,
        spectrum: &TransformedSpectrum,
        scorer: &S,
    ) -> Option<IsotopologueMatch> {
        let params = self.params();
        let entry = self.match_entries().get(index)?;
        let isotopologue = self.isotopologue(&entry.formula, &entry.label_percentiles)?;
        let state = isotopologue.charge_state(entry.charge)?;
        let n_c_peaks = isotopologue.n_c_peaks();
        if n_c_peaks == 0 {
            return None;
        }

        let overlap: TmzSet = state
            .atmzs
            .iter()
            .copied()
            .filter(|tmz| spectrum.tmzs.contains(tmz))
            .collect();
        if overlap.len() < params.minimum_number_of_matched_isotopologues
            || (overlap.len() as f64 / n_c_peaks as f64) < params.required_percentile_peak_overlap
        {
            return None;
        }

        let mut peaks = Vec::with_capacity(n_c_peaks);
        let mut candidates: Vec<(usize, Vec<i64>)> = Vec::new();
        for ((peak, mz), tmzs) in isotopologue
            .peaks
            .iter()
            .zip(state.mz.iter())
            .zip(state.tmzs.iter())
        {
            let Some(range) = tmzs else {
                continue;
            };
            let options: Vec<i64> = range.iter().filter(|t| overlap.contains(t)).collect();
            if !options.is_empty() {
                candidates.push((peaks.len(), options));
            }
            peaks.push(MatchedPeak::unmatched(
                peak.relative_abundance,
                *mz,
                peak.abundance as f64,
            ));
        }
        if candidates.is_empty() {
            return None;
        }

        let mut best: Option<IsotopologueMatch> = None;
        for combination in candidates
            .iter()
            .map(|(_, options)| options.iter().copied())
            .multi_cartesian_product()
        {
            for ((position, _), tmz) in candidates.iter().zip(combination) {
                if let Some((mz, intensity)) = spectrum.peak_at(tmz) {
                    peaks[*position].measured_mz = Some(mz);
                    peaks[*position].measured_intensity = Some(intensity);
                }
            }
            let (score, scaling_factor) = scorer.score(&peaks);
            let improves = match &best {
                Some(b) => {
                    score > b.score || (score == b.score && scaling_factor > b.scaling_factor)
                }
                None => true,
            };
            if improves {
                best = Some(IsotopologueMatch {
                    score,
                    scaling_factor,
                    peaks: peaks.clone(),
                });
            }
        }
        best
    }

    /// Match every isotopologue of the library against a centroided spectrum,
    /// adding the accepted matches to `results`. Returns the number of matches
    /// added.
    ///
    /// `peaks` must be sorted by m/z. `rt` is the retention time in minutes.
    pub fn match_all<C: CentroidLike>(
        &self,
        peaks: &[C],
        file_name: &str,
        spec_id: &str,
        rt: f64,
        results: &mut Results,
    ) -> usize {
        let Some((lower, upper)) = self.mz_range() else {
            return 0;
        };
        let params = self.params();
        let scorer = MScoreScorer::from_params(params);
        let sliced = slice_peaks(peaks, (lower, 0.0), (upper, 0.0), SLICE_TOLERANCE);

        let mut added = 0;
        for match_set in self.match_sets() {
            let spectrum = transform_spectrum(sliced, Some(match_set.mz_range), params);
            let shared = spectrum
                .tmzs
                .iter()
                .filter(|tmz| match_set.tmzs.contains(tmz))
                .count();
            if shared < params.minimum_number_of_matched_isotopologues {
                continue;
            }
            for index in match_set.start..match_set.end {
                let Some(found) = self.match_isotopologue(index, &spectrum, &scorer) else {
                    continue;
                };
                if found.score < params.m_score_threshold
                    || found.matched_peak_count() < params.minimum_number_of_matched_isotopologues
                {
                    continue;
                }
                let entry = &self.match_entries()[index];
                trace!(
                    "{spec_id}: {} z={} {} scored {:0.3}",
                    entry.formula,
                    entry.charge,
                    entry.label_percentiles,
                    found.score
                );
                results.add(
                    MatchKey::new(
                        file_name,
                        entry.formula.as_str(),
                        entry.charge,
                        entry.label_percentiles.clone(),
                    ),
                    Match::new(spec_id, rt, found.score, found.scaling_factor, found.peaks),
                );
                added += 1;
            }
        }
        added
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mzpeaks::CentroidPeak;

    fn spectrum(values: &[(f64, f32)]) -> Vec<CentroidPeak> {
        values
            .iter()
            .enumerate()
            .map(|(i, (mz, intensity))| CentroidPeak::new(*mz, *intensity, i as u32))
            .collect()
    }

    #[test]
    fn test_slice_peaks() {
        let peaks = spectrum(&[
            (1000.0, 1337.0),
            (1001.0, 1337.0),
            (1002.0, 1337.0),
            (1003.0, 1337.0),
            (1004.0, 1337.0),
            (1005.0, 1337.0),
        ]);
        let cases = [
            ((1002.0, 0.001), (1003.0, 0.001), 5),
            ((1002.0, 0.001), (1003.0, 1337.001), 6),
            ((999.0, 0.001), (1001.0, 0.001), 3),
            ((999.0, 0.001), (999.0, 0.001), 2),
            ((1006.0, 0.001), (1006.0, 0.001), 2),
        ];
        for (lower, upper, expected) in cases {
            let sliced = slice_peaks(&peaks, lower, upper, SLICE_TOLERANCE);
            assert_eq!(sliced.len(), expected, "{lower:?} {upper:?}");
        }
        assert_eq!(slice_peaks(&peaks[0..0], (1.0, 0.0), (2.0, 0.0), 2).len(), 0);
    }

    #[test]
    fn test_transform_mz_to_set() {
        let params = Params {
            rel_mz_range: 10e-6,
            internal_precision: 1000.0,
            ..Default::default()
        };
        assert_eq!(transform_mz_to_set(1000.001, &params).len(), 21);

        let params = Params {
            rel_mz_range: 5e-6,
            internal_precision: 10000.0,
            ..Default::default()
        };
        assert_eq!(transform_mz_to_set(1000.0009, &params).len(), 101);
    }

    #[test]
    fn test_transform_spectrum() {
        let params = Params {
            internal_precision: 10000.0,
            ..Default::default()
        };
        let peaks = spectrum(&[(1000.0009, 1.0)]);
        let transformed = transform_spectrum(&peaks, None, &params);
        assert_eq!(transformed.len(), 1);
        assert!(transformed.tmzs.contains(&10000009));
        assert_eq!(transformed.lookup[&10000009], vec![(1000.0009, 1.0)]);
        assert_eq!(transformed.peak_at(10000009), Some((1000.0009, 1.0)));
        assert_eq!(transformed.peak_at(10000010), None);
    }

    #[test_log::test]
    fn test_match_constructed_pattern() {
        let library = IsotopologueLibrary::builder()
            .molecules(["PEPTIDE"])
            .charges([1])
            .build()
            .unwrap();
        let formula = library.lookup().formula_of("PEPTIDE").unwrap().to_string();
        let (_, isotopologue) = library
            .isotopologues(&formula)
            .unwrap()
            .iter()
            .next()
            .unwrap();
        let state = isotopologue.charge_state(1).unwrap();
        let values: Vec<(f64, f32)> = isotopologue
            .peaks
            .iter()
            .zip(state.mz.iter())
            .filter(|(p, _)| p.is_c_peak)
            .map(|(p, mz)| (*mz, (p.abundance * 10) as f32))
            .collect();
        let peaks = spectrum(&values);

        let mut results = library.results();
        let added = library.match_all(&peaks, "test.mzML", "1", 10.0, &mut results);
        assert_eq!(added, 1);
        let (score, _, _, best) = results
            .max_score(&Default::default())
            .unwrap();
        assert!((score - 1.0).abs() < 1e-6, "{score}");
        assert!((best.scaling_factor - 10.0).abs() < 1e-6);
        assert_eq!(best.peaks.len(), values.len());

        let mut empty = library.results();
        let added = library.match_all(&peaks[..1], "test.mzML", "2", 11.0, &mut empty);
        assert_eq!(added, 0);
        assert!(empty.is_empty());
    }
}
