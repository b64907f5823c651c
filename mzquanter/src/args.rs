use std::fmt::Display;
use std::fs;
use std::io::{self, BufRead};
use std::num::ParseFloatError;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mzquant::labels::{FixedLabels, MetabolicLabels};

#[derive(Debug, Error)]
pub enum LabelArgError {
    #[error("Expected ISOTOPE:LEVEL[,LEVEL...] or AMINO_ACID:LABEL, got `{0}`")]
    MissingSeparator(String),
    #[error("The label target is empty in `{0}`")]
    EmptyTarget(String),
    #[error("Failed to parse enrichment level `{0}`: {1}")]
    MalformedLevel(String, ParseFloatError),
    #[error("Enrichment level {0} is outside of [0, 1]")]
    LevelOutOfRange(f64),
}

fn split_label(s: &str) -> Result<(&str, &str), LabelArgError> {
    let (target, rest) = s
        .split_once(':')
        .ok_or_else(|| LabelArgError::MissingSeparator(s.to_string()))?;
    let target = target.trim();
    if target.is_empty() {
        return Err(LabelArgError::EmptyTarget(s.to_string()));
    }
    Ok((target, rest.trim()))
}

/// A metabolic label, an isotope and the enrichment levels to build patterns for,
/// written `15N:0,0.5`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetabolicLabelArg {
    pub isotope: String,
    pub levels: Vec<f64>,
}

impl FromStr for MetabolicLabelArg {
    type Err = LabelArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (isotope, rest) = split_label(s)?;
        let mut levels = Vec::new();
        for token in rest.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let level: f64 = token
                .parse()
                .map_err(|e| LabelArgError::MalformedLevel(token.to_string(), e))?;
            if !(0.0..=1.0).contains(&level) {
                return Err(LabelArgError::LevelOutOfRange(level));
            }
            levels.push(level);
        }
        if levels.is_empty() {
            levels.push(0.0);
        }
        Ok(Self {
            isotope: isotope.to_string(),
            levels,
        })
    }
}

impl TryFrom<String> for MetabolicLabelArg {
    type Error = LabelArgError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for MetabolicLabelArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let levels: Vec<String> = self.levels.iter().map(|l| l.to_string()).collect();
        write!(f, "{}:{}", self.isotope, levels.join(","))
    }
}

impl From<MetabolicLabelArg> for String {
    fn from(value: MetabolicLabelArg) -> Self {
        value.to_string()
    }
}

/// One fixed label state of an amino acid, written `R:Label:13C(6)15N(4)`.
///
/// An empty label, `R:`, is the unlabeled state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FixedLabelArg {
    pub amino_acid: String,
    pub label: String,
}

impl FromStr for FixedLabelArg {
    type Err = LabelArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (amino_acid, label) = split_label(s)?;
        Ok(Self {
            amino_acid: amino_acid.to_string(),
            label: label.to_string(),
        })
    }
}

impl TryFrom<String> for FixedLabelArg {
    type Error = LabelArgError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for FixedLabelArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.amino_acid, self.label)
    }
}

impl From<FixedLabelArg> for String {
    fn from(value: FixedLabelArg) -> Self {
        value.to_string()
    }
}

pub fn collect_metabolic_labels(args: &[MetabolicLabelArg]) -> MetabolicLabels {
    let mut labels = MetabolicLabels::new();
    for arg in args {
        let levels = labels.entry(arg.isotope.clone()).or_default();
        for level in arg.levels.iter() {
            if !levels.contains(level) {
                levels.push(*level);
            }
        }
    }
    labels
}

pub fn collect_fixed_labels(args: &[FixedLabelArg]) -> FixedLabels {
    let mut labels = FixedLabels::new();
    for arg in args {
        labels
            .entry(arg.amino_acid.clone())
            .or_default()
            .push(arg.label.clone());
    }
    labels
}

/// Read one molecule per line, skipping blank lines and `#` comments
pub fn read_molecule_file<P: AsRef<Path>>(path: P) -> io::Result<Vec<String>> {
    let handle = io::BufReader::new(fs::File::open(path)?);
    let mut molecules = Vec::new();
    for line in handle.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        molecules.push(line.to_string());
    }
    Ok(molecules)
}
