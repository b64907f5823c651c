use mzdata::spectrum::MultiLayerSpectrum;
use mzpeaks::{CentroidPeak, DeconvolutedPeak};

pub(crate) type CPeak = CentroidPeak;
pub(crate) type DPeak = DeconvolutedPeak;
pub(crate) type SpectrumType = MultiLayerSpectrum<CPeak, DPeak>;
pub(crate) const PROGRESS_INTERVAL: usize = 1_000;
pub(crate) const STDIN_BUFFER_SIZE: usize = 2usize.pow(20);
