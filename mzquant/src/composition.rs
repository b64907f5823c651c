//! Elemental compositions and the parsers that turn molecule strings into them.
//!
//! A [`Composition`] maps element keys to signed counts. A key is either a plain
//! element symbol like `"C"` or a symbol prefixed with the mass number of a specific
//! isotope like `"13C"`.
//!
//! Molecules are written in one of three ways:
//!
//! - a peptide sequence, `PEPTIDE`, where each residue is an upper case letter
//!   optionally followed by digits selecting a fixed label variant (`R0`, `K1`)
//! - a peptide with modifications, `PEPTIDE#Oxidation:4;Acetyl:0`
//! - a chemical formula prefixed with `+`, either plain (`+H2O`) or in unimod style
//!   with counts in parentheses (`+H(2)16O(1)`)
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MZQuantError;
use crate::knowledge_base::{self, element_mass, natural_isotopes, split_isotope_key};
use crate::params::Params;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition(BTreeMap<String, i32>);

impl Composition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> i32 {
        self.0.get(key).copied().unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, count: i32) {
        self.0.insert(key.to_string(), count);
    }

    pub fn add_element(&mut self, key: &str, count: i32) {
        *self.0.entry(key.to_string()).or_default() += count;
    }

    pub fn remove(&mut self, key: &str) -> Option<i32> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add `factor` copies of `other` to this composition
    pub fn merge(&mut self, other: &Composition, factor: i32) {
        for (k, v) in other.iter() {
            self.add_element(k, v * factor);
        }
    }

    /// Drop all keys with a count of zero
    pub fn retain_nonzero(&mut self) {
        self.0.retain(|_, v| *v != 0);
    }

    fn hill_ordered(&self) -> impl Iterator<Item = (&str, i32)> + '_ {
        let head = ["C", "H"]
            .into_iter()
            .filter_map(|k| self.0.get(k).map(|v| (k, *v)));
        let tail = self
            .iter()
            .filter(|(k, _)| *k != "C" && *k != "H");
        head.chain(tail).filter(|(_, v)| *v != 0)
    }

    /// The Hill notation with every count in parentheses, e.g. `C(3)H(7)N(1)O(3)`.
    ///
    /// This is the canonical formula string used to key isotope patterns.
    pub fn hill_notation_unimod(&self) -> String {
        self.hill_ordered()
            .map(|(k, v)| format!("{k}({v})"))
            .collect()
    }

    /// The Hill notation with counts of one omitted, e.g. `H2O`
    pub fn hill_notation(&self) -> String {
        self.hill_ordered()
            .map(|(k, v)| {
                if v == 1 {
                    k.to_string()
                } else {
                    format!("{k}{v}")
                }
            })
            .collect()
    }

    /// The monoisotopic mass, using the most abundant isotope of plain element keys
    pub fn mass(&self) -> Result<f64, MZQuantError> {
        let mut total = 0.0;
        for (k, v) in self.iter() {
            let mass = element_mass(k).ok_or_else(|| MZQuantError::UnknownElement(k.to_string()))?;
            total += mass * v as f64;
        }
        Ok(total)
    }

    /// Parse a chemical formula.
    ///
    /// If the formula contains any parentheses it is read in unimod style, where
    /// counts are parenthesized and leading digits are isotope mass numbers. Otherwise
    /// digits following an element are its count. Outside of parentheses a `-` makes
    /// the following elements subtract and a `+` switches back to adding.
    pub fn parse_formula(formula: &str) -> Result<Self, MZQuantError> {
        let unimod = formula.contains('(');
        let bytes = formula.as_bytes();
        let malformed = || MZQuantError::MalformedFormula(formula.to_string());
        let mut composition = Self::new();
        let mut sign = 1;
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            match c {
                b'+' => {
                    sign = 1;
                    i += 1;
                }
                b'-' => {
                    sign = -1;
                    i += 1;
                }
                c if c.is_ascii_whitespace() => {
                    i += 1;
                }
                c if c.is_ascii_digit() || c.is_ascii_uppercase() => {
                    let start = i;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    if i >= bytes.len() || !bytes[i].is_ascii_uppercase() {
                        return Err(malformed());
                    }
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_lowercase() {
                        i += 1;
                    }
                    let key = &formula[start..i];
                    let count = if i < bytes.len() && bytes[i] == b'(' {
                        let close = formula[i..].find(')').ok_or_else(malformed)? + i;
                        let count: i32 = formula[i + 1..close]
                            .trim()
                            .parse()
                            .map_err(|_| malformed())?;
                        i = close + 1;
                        count
                    } else if !unimod && i < bytes.len() && bytes[i].is_ascii_digit() {
                        let count_start = i;
                        while i < bytes.len() && bytes[i].is_ascii_digit() {
                            i += 1;
                        }
                        formula[count_start..i].parse().map_err(|_| malformed())?
                    } else {
                        1
                    };
                    validate_element_key(key)?;
                    composition.add_element(key, sign * count);
                }
                _ => return Err(malformed()),
            }
        }
        Ok(composition)
    }

    /// Collect every `<isotope><element>(<count>)` token in `text`, ignoring
    /// anything that does not look like one.
    ///
    /// Tokens naming unknown elements are skipped as well, so free text like
    /// `"FOCK"` yields an empty composition.
    pub fn scan_unimod_tokens(text: &str) -> Self {
        let bytes = text.as_bytes();
        let mut composition = Self::new();
        let mut i = 0;
        while i < bytes.len() {
            match match_unimod_token(text, i) {
                Some((key, count, end)) => {
                    if validate_element_key(key).is_ok() {
                        composition.add_element(key, count);
                    }
                    i = end;
                }
                None => {
                    i += 1;
                }
            }
        }
        composition
    }
}

/// Try to match `[0-9]*[A-Z][a-z]*\(-*[0-9]*\)` at `start`, returning the element key,
/// its count and the end offset.
fn match_unimod_token(text: &str, start: usize) -> Option<(&str, i32, usize)> {
    let bytes = text.as_bytes();
    let mut i = start;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i >= bytes.len() || !bytes[i].is_ascii_uppercase() {
        return None;
    }
    i += 1;
    while i < bytes.len() && bytes[i].is_ascii_lowercase() {
        i += 1;
    }
    let key_end = i;
    if i >= bytes.len() || bytes[i] != b'(' {
        return None;
    }
    i += 1;
    let mut negative = false;
    while i < bytes.len() && bytes[i] == b'-' {
        negative = true;
        i += 1;
    }
    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b')' {
        return None;
    }
    let count: i32 = text[digits_start..i].parse().ok()?;
    let count = if negative { -count } else { count };
    Some((&text[start..key_end], count, i + 1))
}

fn validate_element_key(key: &str) -> Result<(), MZQuantError> {
    let (mass_number, symbol) = split_isotope_key(key);
    let isotopes =
        natural_isotopes(symbol).ok_or_else(|| MZQuantError::UnknownElement(key.to_string()))?;
    if let Some(n) = mass_number {
        if !isotopes.iter().any(|iso| iso.mass_number() == n) {
            return Err(MZQuantError::UnknownIsotope(symbol.to_string(), n));
        }
    }
    Ok(())
}

impl FromStr for Composition {
    type Err = MZQuantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_formula(s)
    }
}

impl Display for Composition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hill_notation())
    }
}

impl<'a> Add<&'a Composition> for &'a Composition {
    type Output = Composition;

    fn add(self, rhs: &'a Composition) -> Self::Output {
        let mut out = self.clone();
        out.merge(rhs, 1);
        out
    }
}

impl AddAssign<&Composition> for Composition {
    fn add_assign(&mut self, rhs: &Composition) {
        self.merge(rhs, 1)
    }
}

impl<'a> Sub<&'a Composition> for &'a Composition {
    type Output = Composition;

    fn sub(self, rhs: &'a Composition) -> Self::Output {
        let mut out = self.clone();
        out.merge(rhs, -1);
        out
    }
}

impl FromIterator<(String, i32)> for Composition {
    fn from_iter<T: IntoIterator<Item = (String, i32)>>(iter: T) -> Self {
        let mut this = Self::new();
        for (k, v) in iter {
            this.add_element(&k, v);
        }
        this
    }
}

/// The composition of water, added once to every peptide
pub fn water() -> Composition {
    [("H".to_string(), 2), ("O".to_string(), 1)]
        .into_iter()
        .collect()
}

/// Amino acid and modification compositions used to resolve molecule strings.
///
/// Starts from the built-in tables and is extended by the user tables in
/// [`Params`] and by fixed label residues like `R1`.
#[derive(Debug, Clone, Default)]
pub struct ChemicalKnowledge {
    amino_acids: HashMap<String, Composition>,
    modifications: HashMap<String, Composition>,
}

impl ChemicalKnowledge {
    pub fn from_params(params: &Params) -> Result<Self, MZQuantError> {
        let mut this = Self::default();
        for (aa, formula) in knowledge_base::AMINO_ACIDS {
            this.amino_acids
                .insert(aa.to_string(), Composition::parse_formula(formula)?);
        }
        for (name, formula) in knowledge_base::MODIFICATIONS {
            this.modifications
                .insert(name.to_string(), Composition::parse_formula(formula)?);
        }
        for (aa, formula) in params.amino_acids.iter() {
            this.amino_acids
                .insert(aa.clone(), Composition::parse_formula(formula)?);
        }
        for (name, formula) in params.modifications.iter() {
            this.modifications
                .insert(name.clone(), Composition::parse_formula(formula)?);
        }
        Ok(this)
    }

    pub fn amino_acid(&self, name: &str) -> Option<&Composition> {
        self.amino_acids.get(name)
    }

    pub fn has_amino_acid(&self, name: &str) -> bool {
        self.amino_acids.contains_key(name)
    }

    pub fn modification(&self, name: &str) -> Option<&Composition> {
        self.modifications.get(name)
    }

    /// Register a residue, replacing and returning any previous definition
    pub fn insert_amino_acid(&mut self, name: String, composition: Composition) -> Option<Composition> {
        self.amino_acids.insert(name, composition)
    }

    /// Resolve a fixed label definition, which is either a modification name or
    /// a free form list of unimod tokens like `C(-6) 13C(6)`
    pub fn parse_label_definition(&self, definition: &str) -> Composition {
        match self.modification(definition) {
            Some(comp) => comp.clone(),
            None => Composition::scan_unimod_tokens(definition),
        }
    }

    /// Resolve a molecule string into its elemental composition
    pub fn parse_molecule(&self, molecule: &str) -> Result<Composition, MZQuantError> {
        if let Some(formula) = molecule.strip_prefix('+') {
            return Composition::parse_formula(formula);
        }
        let mut parts = molecule.split('#');
        let sequence = parts.next().unwrap_or_default();
        let modifications = parts.next();
        if parts.next().is_some() {
            return Err(MZQuantError::TooManyModificationSeparators(
                molecule.to_string(),
            ));
        }

        let mut composition = self.parse_sequence(sequence, molecule)?;
        if let Some(modifications) = modifications {
            for entry in modifications.split(';') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                let (name, position) = entry.rsplit_once(':').ok_or_else(|| {
                    MZQuantError::ModificationWithoutPosition(
                        entry.to_string(),
                        molecule.to_string(),
                    )
                })?;
                if position.trim().parse::<i64>().is_err() {
                    return Err(MZQuantError::ModificationWithoutPosition(
                        entry.to_string(),
                        molecule.to_string(),
                    ));
                }
                let delta = self.modification(name).ok_or_else(|| {
                    MZQuantError::UnknownModification(name.to_string(), molecule.to_string())
                })?;
                composition += delta;
            }
        }
        Ok(composition)
    }

    fn parse_sequence(&self, sequence: &str, molecule: &str) -> Result<Composition, MZQuantError> {
        let mut composition = Composition::new();
        if sequence.is_empty() {
            return Ok(composition);
        }
        for token in tokenize_sequence(sequence) {
            let residue = self.amino_acid(token).ok_or_else(|| {
                MZQuantError::UnknownAminoAcid(token.to_string(), molecule.to_string())
            })?;
            composition += residue;
        }
        composition += &water();
        Ok(composition)
    }
}

/// Split a peptide sequence into residue tokens, each a single character
/// followed by any digits, e.g. `"R0AK12"` becomes `["R0", "A", "K12"]`
pub fn tokenize_sequence(sequence: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in sequence.char_indices() {
        if c.is_ascii_digit() && start.is_some() {
            continue;
        }
        if let Some(s) = start {
            tokens.push(&sequence[s..i]);
        }
        start = Some(i);
    }
    if let Some(s) = start {
        tokens.push(&sequence[s..]);
    }
    tokens
}
