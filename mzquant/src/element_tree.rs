//! Isotope envelopes of single elements at every atom count a library needs.
//!
//! For each element and enrichment level an [`ElementTree`] stores one
//! [`ElementEnvelope`] per atom count ("level"). The envelope of a molecule is
//! later assembled as the product of the envelopes of its elements.
use std::collections::HashMap;

use crate::error::MZQuantError;
use crate::knowledge_base::Isotope;

/// Rescale the natural distribution of an element so that the isotope with mass
/// number `enriched_mass_number` has abundance `target`.
///
/// The remaining isotopes share the difference in proportion to their natural
/// abundances, so the distribution still sums to one.
pub fn recalculate_distribution(
    element: &str,
    natural: &[Isotope],
    target: f64,
    enriched_mass_number: u32,
) -> Result<Vec<Isotope>, MZQuantError> {
    let enriched = natural
        .iter()
        .find(|iso| iso.mass_number() == enriched_mass_number)
        .ok_or_else(|| MZQuantError::UnknownIsotope(element.to_string(), enriched_mass_number))?;
    let total_other: f64 = natural
        .iter()
        .filter(|iso| iso.mass_number() != enriched_mass_number)
        .map(|iso| iso.abundance)
        .sum();
    let difference = enriched.abundance - target;
    let distribution = natural
        .iter()
        .map(|iso| {
            let abundance = if iso.mass_number() == enriched_mass_number {
                target
            } else if total_other > 0.0 {
                iso.abundance + iso.abundance * difference / total_other
            } else {
                iso.abundance
            };
            Isotope::new(iso.mass, abundance, iso.position)
        })
        .collect();
    Ok(distribution)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnvelopePeak {
    pub mass: f64,
    pub abundance: f64,
}

/// The isotope envelope of `n` atoms of one element, indexed by isotope position.
///
/// Only positions in `min_position..=max_position` carry meaningful abundance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementEnvelope {
    pub peaks: Vec<EnvelopePeak>,
    pub min_position: usize,
    pub max_position: usize,
}

impl ElementEnvelope {
    #[inline]
    pub fn width(&self) -> usize {
        self.max_position - self.min_position + 1
    }

    /// The peak at `offset` positions above `min_position`
    #[inline]
    pub fn at_offset(&self, offset: usize) -> Option<&EnvelopePeak> {
        self.peaks.get(self.min_position + offset)
    }

    fn from_distribution(distribution: &[Isotope]) -> Self {
        let peaks = distribution
            .iter()
            .map(|iso| EnvelopePeak {
                mass: iso.mass,
                abundance: iso.abundance,
            })
            .collect();
        Self {
            peaks,
            min_position: distribution.first().map(|i| i.position).unwrap_or_default(),
            max_position: distribution.last().map(|i| i.position).unwrap_or_default(),
        }
    }

    /// Set the position bounds from the first and last peak above `threshold`,
    /// falling back to the single most abundant peak
    fn bound_by_threshold(&mut self, threshold: f64) {
        let first = self.peaks.iter().position(|p| p.abundance > threshold);
        let last = self.peaks.iter().rposition(|p| p.abundance > threshold);
        match (first, last) {
            (Some(first), Some(last)) => {
                self.min_position = first;
                self.max_position = last;
            }
            _ => {
                let argmax = argmax_abundance(&self.peaks);
                self.min_position = argmax;
                self.max_position = argmax;
            }
        }
    }
}

fn argmax_abundance(peaks: &[EnvelopePeak]) -> usize {
    peaks
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.abundance.total_cmp(&b.abundance))
        .map(|(i, _)| i)
        .unwrap_or_default()
}

fn binomial_coefficient(n: usize, k: usize) -> f64 {
    let k = k.min(n - k);
    let mut acc = 1.0;
    for i in 0..k {
        acc = acc * (n - i) as f64 / (i + 1) as f64;
    }
    acc
}

fn ln_binomial_coefficient(n: usize, k: usize) -> f64 {
    let k = k.min(n - k);
    (0..k)
        .map(|i| ((n - i) as f64).ln() - ((i + 1) as f64).ln())
        .sum()
}

/// The probability of observing `k` heavy atoms among `n` with light and heavy
/// abundances `a` and `b`.
///
/// Large `n` overflow the coefficient, those are computed in log space.
pub(crate) fn binomial_probability(n: usize, k: usize, a: f64, b: f64) -> f64 {
    let light = (n - k) as i32;
    let heavy = k as i32;
    let coefficient = binomial_coefficient(n, k);
    if coefficient.is_finite() {
        let p = coefficient * a.powi(light) * b.powi(heavy);
        if p.is_finite() {
            return p;
        }
    }
    let ln_p = ln_binomial_coefficient(n, k) + light as f64 * a.ln() + heavy as f64 * b.ln();
    ln_p.exp()
}

/// Envelopes of one element at one enrichment level, keyed by atom count
#[derive(Debug, Clone, Default)]
pub struct ElementTree {
    levels: HashMap<usize, ElementEnvelope>,
}

impl ElementTree {
    /// Build all levels up to `count` atoms.
    ///
    /// `two_isotope_start` is the smallest atom count of any two isotope element in
    /// the library, binomial levels are only built from there on.
    pub fn build(
        distribution: &[Isotope],
        count: usize,
        two_isotope_start: usize,
        min_abundance: f64,
    ) -> Self {
        let mut this = Self::default();
        this.levels
            .insert(1, ElementEnvelope::from_distribution(distribution));
        match distribution.len() {
            0 => {}
            1 => this.build_single_isotope(&distribution[0], count),
            2 => this.build_binomial(distribution, count, two_isotope_start.max(1), min_abundance),
            _ => this.build_convolved(distribution, count, min_abundance),
        }
        this
    }

    pub fn level(&self, count: usize) -> Option<&ElementEnvelope> {
        self.levels.get(&count)
    }

    pub fn max_level(&self) -> usize {
        self.levels.keys().copied().max().unwrap_or_default()
    }

    fn build_single_isotope(&mut self, isotope: &Isotope, count: usize) {
        let mut mass = isotope.mass;
        for n in 2..=count {
            mass += isotope.mass;
            self.levels.insert(
                n,
                ElementEnvelope {
                    peaks: vec![EnvelopePeak {
                        mass,
                        abundance: 1.0,
                    }],
                    min_position: 0,
                    max_position: 0,
                },
            );
        }
    }

    fn build_binomial(
        &mut self,
        distribution: &[Isotope],
        count: usize,
        start: usize,
        min_abundance: f64,
    ) {
        let (light, heavy) = (&distribution[0], &distribution[1]);
        // Leading positions found negligible at one level stay negligible at the next
        let mut first_k = 0usize;
        for n in start..=count {
            let mut peaks = vec![EnvelopePeak::default(); first_k.min(n + 1)];
            let mut bounds: Option<(usize, usize)> = None;
            for k in first_k..=n {
                let mass = (n - k) as f64 * light.mass + k as f64 * heavy.mass;
                let abundance = binomial_probability(n, k, light.abundance, heavy.abundance);
                if abundance <= min_abundance {
                    peaks.push(EnvelopePeak {
                        mass,
                        abundance: 0.0,
                    });
                    if bounds.is_some() {
                        break;
                    }
                    first_k = k + 1;
                } else {
                    peaks.push(EnvelopePeak { mass, abundance });
                    bounds = match bounds {
                        Some((lo, _)) => Some((lo, k)),
                        None => Some((k, k)),
                    };
                }
            }
            let envelope = match bounds {
                Some((min_position, max_position)) => ElementEnvelope {
                    peaks,
                    min_position,
                    max_position,
                },
                None => {
                    let peaks: Vec<EnvelopePeak> = (0..=n)
                        .map(|k| EnvelopePeak {
                            mass: (n - k) as f64 * light.mass + k as f64 * heavy.mass,
                            abundance: binomial_probability(
                                n,
                                k,
                                light.abundance,
                                heavy.abundance,
                            ),
                        })
                        .collect();
                    let argmax = argmax_abundance(&peaks);
                    ElementEnvelope {
                        peaks,
                        min_position: argmax,
                        max_position: argmax,
                    }
                }
            };
            self.levels.insert(n, envelope);
        }
    }

    /// Levels for elements with more than two isotopes are built by convolving the
    /// previous level with the isotope distribution. The mass at a position is the
    /// mean over all paths leading to it.
    fn build_convolved(&mut self, distribution: &[Isotope], count: usize, min_abundance: f64) {
        let mut previous = ElementEnvelope::from_distribution(distribution);
        for n in 2..=count + 1 {
            let size = previous.peaks.len() + distribution.len() - 1;
            let mut abundances = vec![0.0; size];
            let mut mass_sums = vec![0.0; size];
            let mut paths = vec![0usize; size];
            for (position, peak) in previous.peaks.iter().enumerate() {
                for isotope in distribution {
                    let i = position + isotope.position;
                    abundances[i] += peak.abundance * isotope.abundance;
                    mass_sums[i] += peak.mass + isotope.mass;
                    paths[i] += 1;
                }
            }
            let peaks = abundances
                .into_iter()
                .zip(mass_sums)
                .zip(paths)
                .map(|((abundance, mass_sum), paths)| EnvelopePeak {
                    mass: if paths > 0 {
                        mass_sum / paths as f64
                    } else {
                        0.0
                    },
                    abundance,
                })
                .collect();
            let mut envelope = ElementEnvelope {
                peaks,
                min_position: 0,
                max_position: 0,
            };
            envelope.bound_by_threshold(min_abundance);
            self.levels.insert(n, envelope.clone());
            previous = envelope;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::knowledge_base::natural_isotopes;

    macro_rules! assert_is_close {
        ($t1:expr, $t2:expr, $tol:expr, $label:literal) => {
            assert!(
                ($t1 - $t2).abs() < $tol,
                "Observed {} {}, expected {}, difference {}",
                $label,
                $t1,
                $t2,
                $t1 - $t2,
            );
        };
    }

    #[test]
    fn test_recalculate_distribution() {
        let cases = [("N", 15, 0.994), ("O", 18, 0.970), ("N", 15, 0.32)];
        for (element, mass_number, target) in cases {
            let natural = natural_isotopes(element).unwrap();
            let dist = recalculate_distribution(element, &natural, target, mass_number).unwrap();
            let enriched = dist
                .iter()
                .find(|i| i.mass_number() == mass_number)
                .unwrap();
            assert_eq!(enriched.abundance, target);
            let total: f64 = dist.iter().map(|i| i.abundance).sum();
            assert_is_close!(total, 1.0, 1e-12, "total");
            assert_eq!(dist.len(), natural.len());
        }
        let natural = natural_isotopes("N").unwrap();
        assert!(matches!(
            recalculate_distribution("N", &natural, 0.5, 16),
            Err(MZQuantError::UnknownIsotope(_, 16))
        ));
    }

    #[test]
    fn test_binomial_probability() {
        assert_is_close!(binomial_probability(2, 1, 0.5, 0.5), 0.5, 1e-12, "p");
        assert_is_close!(binomial_probability(10, 0, 0.9, 0.1), 0.9f64.powi(10), 1e-12, "p");
        // log space path
        let p = binomial_probability(2000, 1000, 0.5, 0.5);
        assert!(p.is_finite() && p > 0.0);
        assert_is_close!(p, 0.017839, 1e-5, "p");
    }

    #[test]
    fn test_single_isotope_levels() {
        let dist = natural_isotopes("P").unwrap();
        let tree = ElementTree::build(&dist, 3, 1, 1e-3);
        let level = tree.level(3).unwrap();
        assert_eq!(level.width(), 1);
        assert_is_close!(level.peaks[0].mass, 3.0 * 30.973761998, 1e-9, "mass");
        assert_eq!(level.peaks[0].abundance, 1.0);
    }

    #[test]
    fn test_binomial_levels() {
        let dist = natural_isotopes("C").unwrap();
        let tree = ElementTree::build(&dist, 50, 3, 1e-3);
        assert_eq!(tree.level(1).unwrap().max_position, 1);
        assert!(tree.level(2).is_none());
        let level = tree.level(50).unwrap();
        assert_eq!(level.min_position, 0);
        let mono = level.peaks[0];
        assert_is_close!(mono.abundance, 0.9893f64.powi(50), 1e-12, "abundance");
        assert_is_close!(mono.mass, 600.0, 1e-9, "mass");
        let total: f64 = level.peaks[level.min_position..=level.max_position]
            .iter()
            .map(|p| p.abundance)
            .sum();
        assert!(total > 0.99);

        let dist = natural_isotopes("H").unwrap();
        let tree = ElementTree::build(&dist, 4, 1, 1e-3);
        let level = tree.level(1).unwrap();
        assert_eq!(level.max_position, 0);
    }

    #[test]
    fn test_convolved_levels() {
        let dist = natural_isotopes("O").unwrap();
        let tree = ElementTree::build(&dist, 3, 1, 1e-3);
        assert_eq!(tree.max_level(), 4);
        let level = tree.level(2).unwrap();
        assert_eq!(level.peaks.len(), 5);
        assert_is_close!(level.peaks[0].abundance, 0.99757 * 0.99757, 1e-12, "abundance");
        assert_is_close!(level.peaks[0].mass, 2.0 * 15.99491462, 1e-9, "mass");
        // 17O twice or 16O with 18O
        let expected = (2.0 * 16.999131757 + 2.0 * (15.99491462 + 17.999159613)) / 3.0;
        assert_is_close!(level.peaks[2].mass, expected, 1e-9, "mass");
        assert_eq!(level.min_position, 0);
        assert_eq!(level.max_position, 2);
    }
}
