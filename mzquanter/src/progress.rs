use std::ops::{Add, AddAssign};

/// Counts accumulated while matching a run
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub spectra: usize,
    pub spectra_with_matches: usize,
    pub spectra_not_centroided: usize,
    pub peaks: usize,
    pub matches: usize,
}

impl Add for ProgressRecord {
    type Output = ProgressRecord;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for ProgressRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.spectra += rhs.spectra;
        self.spectra_with_matches += rhs.spectra_with_matches;
        self.spectra_not_centroided += rhs.spectra_not_centroided;
        self.peaks += rhs.peaks;
        self.matches += rhs.matches;
    }
}

/// What matching a single spectrum produced, sent to the progress collector
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumMatchRecord {
    pub index: usize,
    pub spec_id: String,
    pub rt: f64,
    pub peaks: usize,
    pub matches: usize,
}
