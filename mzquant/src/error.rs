use std::io;

use thiserror::Error;

/// The ways building an isotopologue library or processing its results can fail
#[derive(Debug, Error)]
pub enum MZQuantError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Unknown amino acid {0:?} in {1:?}")]
    UnknownAminoAcid(String, String),
    #[error("Unknown modification {0:?} in {1:?}")]
    UnknownModification(String, String),
    #[error("Modification {0:?} in {1:?} has no valid position")]
    ModificationWithoutPosition(String, String),
    #[error("Could not parse chemical formula {0:?}")]
    MalformedFormula(String),
    #[error("Unknown element {0:?}")]
    UnknownElement(String),
    #[error("Element {0:?} has no isotope with mass number {1}")]
    UnknownIsotope(String, u32),
    #[error("Molecule {0:?} contains more than one modification separator '#'")]
    TooManyModificationSeparators(String),
    #[error("Molecule {0:?} has a negative count of {1}")]
    NegativeElementCount(String, String),
    #[error("At least two amino acids must be locked in a SILAC experiment, got {0:?}")]
    LockedAminoAcidsTooFew(Vec<String>),
    #[error("Locked amino acids must carry the same number of fixed labels, {0:?} does not")]
    LockedLabelCountMismatch(Vec<String>),
    #[error("No isotope envelope for {1} atoms of {0} at enrichment {2}")]
    MissingEnvelope(String, usize, String),
    #[error("A serialization error occurred: {0}")]
    SerializationError(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("A CSV error occurred: {0}")]
    CSVError(
        #[source]
        #[from]
        csv::Error,
    ),
}
