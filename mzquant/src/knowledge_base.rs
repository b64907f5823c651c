//! Static element, amino acid and modification tables
use serde::{Deserialize, Serialize};

/// The mass of H+, a hydrogen atom minus an electron
pub const PROTON: f64 = 1.00727646677;

/// The mass of an electron, derived from the hydrogen mass and [`PROTON`]
pub const ELECTRON: f64 = 1.0078250322 - PROTON;

/// A single isotope of an element with its natural abundance.
///
/// `position` is the index of the isotope in the element's isotope list, which
/// is what element envelopes are indexed by, not the nominal mass difference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Isotope {
    pub mass: f64,
    pub abundance: f64,
    pub position: usize,
}

impl Isotope {
    pub fn new(mass: f64, abundance: f64, position: usize) -> Self {
        Self {
            mass,
            abundance,
            position,
        }
    }

    /// The nominal mass number of the isotope, e.g. 13 for carbon 13
    #[inline]
    pub fn mass_number(&self) -> u32 {
        self.mass.round() as u32
    }
}

const HYDROGEN: &[(f64, f64)] = &[(1.0078250322, 0.999885), (2.0141017781, 0.000115)];
const CARBON: &[(f64, f64)] = &[(12.0, 0.9893), (13.003354835, 0.0107)];
const NITROGEN: &[(f64, f64)] = &[(14.003074004, 0.99636), (15.000108899, 0.00364)];
const OXYGEN: &[(f64, f64)] = &[
    (15.99491462, 0.99757),
    (16.999131757, 0.00038),
    (17.999159613, 0.00205),
];
const SILICON: &[(f64, f64)] = &[
    (27.976926535, 0.92223),
    (28.976494665, 0.04685),
    (29.97377001, 0.03092),
];
const PHOSPHORUS: &[(f64, f64)] = &[(30.973761998, 1.0)];
const SULFUR: &[(f64, f64)] = &[
    (31.972071174, 0.9499),
    (32.97145891, 0.0075),
    (33.967867, 0.0425),
    (35.967081, 0.0001),
];
const SODIUM: &[(f64, f64)] = &[(22.98976928, 1.0)];
const CHLORINE: &[(f64, f64)] = &[(34.9688527, 0.7576), (36.9659026, 0.2424)];
const BROMINE: &[(f64, f64)] = &[(78.918338, 0.5069), (80.91629, 0.4931)];
const SELENIUM: &[(f64, f64)] = &[
    (73.9224759, 0.0089),
    (75.9192137, 0.0937),
    (76.9199142, 0.0763),
    (77.917309, 0.2377),
    (79.916522, 0.4961),
    (81.9167, 0.0873),
];
const FLUORINE: &[(f64, f64)] = &[(18.99840322, 1.0)];

const ELEMENTS: &[(&str, &[(f64, f64)])] = &[
    ("H", HYDROGEN),
    ("C", CARBON),
    ("N", NITROGEN),
    ("O", OXYGEN),
    ("Si", SILICON),
    ("P", PHOSPHORUS),
    ("S", SULFUR),
    ("Na", SODIUM),
    ("Cl", CHLORINE),
    ("Br", BROMINE),
    ("Se", SELENIUM),
    ("F", FLUORINE),
];

/// The residue compositions of the twenty standard amino acids
pub const AMINO_ACIDS: &[(&str, &str)] = &[
    ("A", "C3H5NO"),
    ("C", "C3H5NOS"),
    ("D", "C4H5NO3"),
    ("E", "C5H7NO3"),
    ("F", "C9H9NO"),
    ("G", "C2H3NO"),
    ("H", "C6H7N3O"),
    ("I", "C6H11NO"),
    ("K", "C6H12N2O"),
    ("L", "C6H11NO"),
    ("M", "C5H9NOS"),
    ("N", "C4H6N2O2"),
    ("P", "C5H7NO"),
    ("Q", "C5H8N2O2"),
    ("R", "C6H12N4O"),
    ("S", "C3H5NO2"),
    ("T", "C4H7NO2"),
    ("V", "C5H9NO"),
    ("W", "C11H10N2O"),
    ("Y", "C9H9NO2"),
];

/// Commonly used modifications by their Unimod name and composition delta
pub const MODIFICATIONS: &[(&str, &str)] = &[
    ("Oxidation", "O"),
    ("Dioxidation", "O(2)"),
    ("Acetyl", "H(2)C(2)O"),
    ("Carbamidomethyl", "H(3)C(2)NO"),
    ("Carbamyl", "HCNO"),
    ("Phospho", "HO(3)P"),
    ("Deamidated", "H(-1)N(-1)O"),
    ("Methyl", "H(2)C"),
    ("Dimethyl", "H(4)C(2)"),
    ("Trimethyl", "H(6)C(3)"),
    ("Amidated", "HNO(-1)"),
    ("Gln->pyro-Glu", "H(-3)N(-1)"),
    ("Glu->pyro-Glu", "H(-2)O(-1)"),
    ("Formyl", "CO"),
    ("Label:13C(6)", "C(-6)13C(6)"),
    ("Label:13C(6)15N(2)", "C(-6)13C(6)N(-2)15N(2)"),
    ("Label:13C(6)15N(4)", "C(-6)13C(6)N(-4)15N(4)"),
    ("Label:2H(4)", "H(-4)2H(4)"),
    ("TMT6plex", "H(20)C(8)13C(4)N15NO(2)"),
    ("Propionamide", "H(5)C(3)NO"),
    ("Nitro", "H(-1)NO(2)"),
    ("Cation:Na", "H(-1)Na"),
];

/// The natural isotopes of `element` ordered by mass, if the element is known
pub fn natural_isotopes(element: &str) -> Option<Vec<Isotope>> {
    ELEMENTS
        .iter()
        .find(|(symbol, _)| *symbol == element)
        .map(|(_, isotopes)| {
            isotopes
                .iter()
                .enumerate()
                .map(|(i, (mass, abundance))| Isotope::new(*mass, *abundance, i))
                .collect()
        })
}

/// All element symbols with a known isotope distribution
pub fn element_symbols() -> impl Iterator<Item = &'static str> {
    ELEMENTS.iter().map(|(symbol, _)| *symbol)
}

/// Split an element key like `"13C"` into its mass number and element symbol.
///
/// Plain symbols have no mass number.
pub fn split_isotope_key(key: &str) -> (Option<u32>, &str) {
    let split = key
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(key.len());
    let (number, symbol) = key.split_at(split);
    (number.parse().ok(), symbol)
}

/// The natural isotope with the highest abundance
pub fn most_abundant(isotopes: &[Isotope]) -> Option<&Isotope> {
    isotopes
        .iter()
        .max_by(|a, b| a.abundance.total_cmp(&b.abundance))
}

/// The monoisotopic mass contributed by one atom of `key`, which may carry a
/// mass number prefix selecting a specific isotope.
pub fn element_mass(key: &str) -> Option<f64> {
    let (mass_number, symbol) = split_isotope_key(key);
    let isotopes = natural_isotopes(symbol)?;
    match mass_number {
        Some(n) => isotopes
            .iter()
            .find(|iso| iso.mass_number() == n)
            .map(|iso| iso.mass),
        None => most_abundant(&isotopes).map(|iso| iso.mass),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_abundances_sum_to_one() {
        for symbol in element_symbols() {
            let isotopes = natural_isotopes(symbol).unwrap();
            let total: f64 = isotopes.iter().map(|i| i.abundance).sum();
            assert!((total - 1.0).abs() < 1e-3, "{symbol} sums to {total}");
            for (i, iso) in isotopes.iter().enumerate() {
                assert_eq!(iso.position, i);
            }
        }
    }

    #[test]
    fn test_split_isotope_key() {
        assert_eq!(split_isotope_key("13C"), (Some(13), "C"));
        assert_eq!(split_isotope_key("Se"), (None, "Se"));
        assert_eq!(split_isotope_key("37Cl"), (Some(37), "Cl"));
    }

    #[test]
    fn test_element_mass() {
        assert_eq!(element_mass("C"), Some(12.0));
        assert_eq!(element_mass("13C"), Some(13.003354835));
        assert_eq!(element_mass("Se"), Some(79.916522));
        assert_eq!(element_mass("14C"), None);
        assert_eq!(element_mass("Xx"), None);
        assert!((ELECTRON - 0.00054856543).abs() < 1e-9);
    }
}
