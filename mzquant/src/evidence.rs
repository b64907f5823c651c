//! Identification evidence read from search engine result tables.
//!
//! Evidences attach retention times and identification scores to molecules, which
//! later bound the retention time windows used for quantification.
//!
//! Search engines report fixed modifications as part of each peptide, while the
//! library models them as fixed label residues. [`format_fixed_labels`] removes
//! them from molecules before the library expands its fixed label variants.
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::composition::{ChemicalKnowledge, Composition};
use crate::error::MZQuantError;
use crate::labels::FixedLabels;

const SEQUENCE_COLUMN: &str = "Sequence";
const MODIFICATIONS_COLUMN: &str = "Modifications";
const RETENTION_TIME_COLUMN: &str = "Retention Time (s)";
const TRIVIAL_NAME_COLUMNS: &[&str] = &["Protein ID", "trivial_name", "accession"];

/// The default column holding the identification score
pub const DEFAULT_SCORE_FIELD: &str = "PEP";

/// A single identification of a molecule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Retention time in minutes
    pub rt: Option<f64>,
    pub score: Option<f64>,
    pub score_field: Option<String>,
    pub trivial_name: Option<String>,
}

/// All identifications of one molecule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoleculeEvidence {
    pub evidences: Vec<Evidence>,
    pub trivial_names: BTreeSet<String>,
}

pub type EvidenceLookup = BTreeMap<String, MoleculeEvidence>;

/// Read a comma separated evidence table, grouping rows by molecule.
///
/// Molecules are written as `SEQUENCE#Modifications` when the modification
/// column is not empty, matching the molecule syntax of the library.
pub fn read_evidence_csv<R: BufRead>(
    reader: R,
    score_field: &str,
) -> Result<EvidenceLookup, MZQuantError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()?
        .iter()
        .map(|s| s.trim().to_string())
        .collect();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let sequence_idx = column(SEQUENCE_COLUMN);
    let modifications_idx = column(MODIFICATIONS_COLUMN);
    let rt_idx = column(RETENTION_TIME_COLUMN);
    let score_idx = column(score_field);
    let name_indices: Vec<usize> = TRIVIAL_NAME_COLUMNS
        .iter()
        .filter_map(|name| column(name))
        .collect();

    let mut lookup = EvidenceLookup::new();
    let Some(sequence_idx) = sequence_idx else {
        debug!("Evidence table has no {SEQUENCE_COLUMN} column");
        return Ok(lookup);
    };

    for record in csv_reader.records() {
        let record = record?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let Some(sequence) = field(Some(sequence_idx)) else {
            continue;
        };
        let molecule = match field(modifications_idx) {
            Some(mods) => format!("{sequence}#{mods}"),
            None => sequence.to_string(),
        };

        let mut evidence = Evidence {
            rt: field(rt_idx)
                .and_then(|v| v.parse::<f64>().ok())
                .map(|seconds| seconds / 60.0),
            ..Default::default()
        };
        if let Some(score) = field(score_idx).and_then(|v| v.parse::<f64>().ok()) {
            evidence.score = Some(score);
            evidence.score_field = Some(score_field.to_string());
        }

        let entry = lookup.entry(molecule).or_default();
        for idx in name_indices.iter() {
            if let Some(name) = field(Some(*idx)) {
                entry.trivial_names.insert(name.to_string());
                evidence.trivial_name = Some(match evidence.trivial_name.take() {
                    Some(prev) => format!("{prev};{name}"),
                    None => name.to_string(),
                });
            }
        }
        entry.evidences.push(evidence);
    }
    debug!("Read evidence for {} molecules", lookup.len());
    Ok(lookup)
}

/// Modifications introduced during sample preparation. Their nitrogen is not part
/// of a metabolically labeled pool and is kept at `14N`.
pub const POST_EXPERIMENTAL_MODIFICATIONS: &[&str] = &["Carbamidomethyl"];

/// A fixed label state of an amino acid
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedModification {
    pub amino_acid: String,
    /// The name evidence tables use for this modification, if it has one
    pub name: Option<String>,
    pub composition: Composition,
}

impl FixedModification {
    pub fn new<A: Into<String>>(
        amino_acid: A,
        name: Option<String>,
        mut composition: Composition,
    ) -> Self {
        let post_experimental = name
            .as_deref()
            .is_some_and(|n| POST_EXPERIMENTAL_MODIFICATIONS.contains(&n));
        if post_experimental {
            if let Some(count) = composition.remove("N") {
                composition.add_element("14N", count);
            }
        }
        composition.retain_nonzero();
        Self {
            amino_acid: amino_acid.into(),
            name,
            composition,
        }
    }

    /// Resolve a fixed label definition, either a known modification name or a
    /// list of unimod tokens. An empty definition is the unmodified state.
    pub fn from_definition(knowledge: &ChemicalKnowledge, amino_acid: &str, definition: &str) -> Self {
        let name = knowledge
            .modification(definition)
            .map(|_| definition.to_string());
        Self::new(amino_acid, name, knowledge.parse_label_definition(definition))
    }

    /// The composition in unimod Hill notation, usable as a fixed label definition
    pub fn label_definition(&self) -> String {
        self.composition.hill_notation_unimod()
    }
}

/// Molecules and evidences with their fixed modifications removed, and the fixed
/// labels to build them with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedEvidence {
    pub fixed_labels: FixedLabels,
    /// Sorted and free of duplicates, including every molecule with evidence
    pub molecules: Vec<String>,
    pub evidences: EvidenceLookup,
}

/// Remove fixed modifications from `molecules` and the molecules of `evidences`.
///
/// A modification is removed when its name belongs to a fixed modification and it
/// sits on an amino acid carrying fixed labels, so `CLEINER#Carbamidomethyl:1;Oxidation:2`
/// becomes `CLEINER#Oxidation:2` for a fixed Carbamidomethyl on C. Evidences of
/// molecules that become identical are merged.
pub fn format_fixed_labels(
    fixed_modifications: &[FixedModification],
    molecules: &[String],
    evidences: EvidenceLookup,
) -> FormattedEvidence {
    let mut fixed_labels = FixedLabels::new();
    let mut fixed_names: BTreeSet<&str> = BTreeSet::new();
    for modification in fixed_modifications {
        fixed_labels
            .entry(modification.amino_acid.clone())
            .or_default()
            .push(modification.label_definition());
        if let Some(name) = modification.name.as_deref() {
            fixed_names.insert(name);
        }
    }

    let mut formatted_molecules = BTreeSet::new();
    let mut formatted_evidences = EvidenceLookup::new();
    for molecule in molecules {
        formatted_molecules.insert(strip_fixed_modifications(molecule, &fixed_labels, &fixed_names));
    }
    for (molecule, evidence) in evidences {
        let stripped = strip_fixed_modifications(&molecule, &fixed_labels, &fixed_names);
        if stripped != molecule {
            debug!("Evidence for {molecule} is kept as {stripped}");
        }
        formatted_molecules.insert(stripped.clone());
        let entry = formatted_evidences.entry(stripped).or_default();
        entry.evidences.extend(evidence.evidences);
        entry.trivial_names.extend(evidence.trivial_names);
    }

    FormattedEvidence {
        fixed_labels,
        molecules: formatted_molecules.into_iter().collect(),
        evidences: formatted_evidences,
    }
}

fn strip_fixed_modifications(
    molecule: &str,
    fixed_labels: &FixedLabels,
    fixed_names: &BTreeSet<&str>,
) -> String {
    let Some((sequence, modifications)) = molecule.split_once('#') else {
        return molecule.to_string();
    };
    let kept: Vec<&str> = modifications
        .split(';')
        .filter(|entry| {
            let Some((name, position)) = entry.rsplit_once(':') else {
                return true;
            };
            let residue = position
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|p| p.checked_sub(1))
                .and_then(|p| sequence.chars().nth(p));
            match residue {
                Some(aa) => {
                    let mut buf = [0u8; 4];
                    !(fixed_names.contains(name) && fixed_labels.contains_key(&*aa.encode_utf8(&mut buf)))
                }
                None => true,
            }
        })
        .collect();
    if kept.is_empty() {
        sequence.to_string()
    } else {
        format!("{sequence}#{}", kept.join(";"))
    }
}

pub fn read_evidence_file<P: AsRef<Path>>(
    path: P,
    score_field: &str,
) -> Result<EvidenceLookup, MZQuantError> {
    let handle = BufReader::new(File::open(path)?);
    read_evidence_csv(handle, score_field)
}

#[cfg(test)]
mod test {
    use super::*;

    const TABLE: &str = "\
Spectrum ID,Sequence,Modifications,Retention Time (s),PEP,Protein ID
BSA1.1165.1165.2,DDSPDLPK,,1746.0,0.0012,BSA
BSA1.1166.1166.2,DDSPDLPK,,1752.0,,BSA
BSA1.2001.2001.3,CCTESLVNR,Carbamidomethyl:1;Carbamidomethyl:2,2400.0,0.01,BSA_C
";

    #[test]
    fn test_read_evidence() {
        let lookup = read_evidence_csv(TABLE.as_bytes(), DEFAULT_SCORE_FIELD).unwrap();
        assert_eq!(lookup.len(), 2);
        let ddsp = &lookup["DDSPDLPK"];
        assert_eq!(ddsp.evidences.len(), 2);
        assert_eq!(ddsp.evidences[0].rt, Some(29.1));
        assert_eq!(ddsp.evidences[0].score, Some(0.0012));
        assert_eq!(ddsp.evidences[0].score_field.as_deref(), Some("PEP"));
        assert_eq!(ddsp.evidences[1].score, None);
        assert_eq!(ddsp.evidences[1].trivial_name.as_deref(), Some("BSA"));
        assert!(ddsp.trivial_names.contains("BSA"));

        let cc = &lookup["CCTESLVNR#Carbamidomethyl:1;Carbamidomethyl:2"];
        assert_eq!(cc.evidences[0].rt, Some(40.0));
    }

    #[test]
    fn test_format_fixed_labels() {
        let knowledge = ChemicalKnowledge::from_params(&Default::default()).unwrap();
        let fixed = [
            FixedModification::from_definition(&knowledge, "C", "Carbamidomethyl"),
            FixedModification::from_definition(&knowledge, "C", ""),
        ];
        assert_eq!(fixed[0].name.as_deref(), Some("Carbamidomethyl"));
        assert_eq!(fixed[1].name, None);

        let molecules = [
            "CLEINERTEST#Carbamidomethyl:1".to_string(),
            "CLEINERTEST#Carbamidomethyl:1;Oxidation:2".to_string(),
        ];
        let formatted = format_fixed_labels(&fixed, &molecules, EvidenceLookup::new());
        assert_eq!(
            formatted.fixed_labels["C"],
            vec!["C(2)H(3)14N(1)O(1)".to_string(), "".to_string()]
        );
        assert_eq!(
            formatted.molecules,
            vec!["CLEINERTEST".to_string(), "CLEINERTEST#Oxidation:2".to_string()]
        );
    }

    #[test]
    fn test_format_fixed_labels_evidence() {
        let knowledge = ChemicalKnowledge::from_params(&Default::default()).unwrap();
        let fixed = [FixedModification::from_definition(&knowledge, "C", "Carbamidomethyl")];
        let table = "\
Sequence,Modifications,Retention Time (s),PEP,Protein ID
CCTESLVNR,Carbamidomethyl:1;Carbamidomethyl:2,2400.0,0.01,BSA
CCTESLVNR,,2460.0,0.02,BSA
CCTESLVNR,Carbamidomethyl:0,2460.0,0.02,BSA
";
        let evidences = read_evidence_csv(table.as_bytes(), DEFAULT_SCORE_FIELD).unwrap();
        assert_eq!(evidences.len(), 3);
        let formatted = format_fixed_labels(&fixed, &[], evidences);
        assert_eq!(
            formatted.molecules,
            vec!["CCTESLVNR".to_string(), "CCTESLVNR#Carbamidomethyl:0".to_string()]
        );
        let merged = &formatted.evidences["CCTESLVNR"];
        assert_eq!(merged.evidences.len(), 2);
        assert_eq!(merged.evidences[0].rt, Some(41.0));
        assert!(merged.trivial_names.contains("BSA"));

        let named = FixedModification::from_definition(&knowledge, "R", "Label:13C(6)15N(4)");
        assert_eq!(named.name.as_deref(), Some("Label:13C(6)15N(4)"));
        assert_eq!(named.label_definition(), "C(-6)13C(6)15N(4)N(-4)");
        let unnamed = FixedModification::from_definition(&knowledge, "R", "13C(6)");
        assert_eq!(unnamed.name, None);
        assert_eq!(unnamed.label_definition(), "13C(6)");
    }

    #[test]
    fn test_missing_sequence_column() {
        let lookup = read_evidence_csv("a,b\n1,2\n".as_bytes(), "PEP").unwrap();
        assert!(lookup.is_empty());
    }
}
