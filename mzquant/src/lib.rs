//! Quantification of molecules in mass spectra by matching theoretical
//! isotopologue patterns.
//!
//! An [`IsotopologueLibrary`] holds the isotope patterns of a set of molecules at
//! every requested charge and label enrichment. Its match functions score the
//! patterns against centroided spectra and collect the accepted matches in
//! [`Results`].
pub mod knowledge_base;
pub mod composition;
pub mod element_tree;
pub mod labels;
pub mod params;
pub mod error;
pub mod evidence;
pub mod library;
pub mod scorer;
pub mod matcher;
pub mod results;

pub use crate::error::MZQuantError;
pub use crate::library::{IsotopologueLibrary, IsotopologueLibraryBuilder};
pub use crate::params::Params;
pub use crate::results::{Match, MatchKey, MzTabMetaInfo, Results};
pub use crate::scorer::{IsotopicPatternScorer, MScoreScorer};
