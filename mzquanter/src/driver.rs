use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;

use clap::parser::ValueSource;
use clap::{ArgMatches, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::Dict,
    Figment,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use thiserror::Error;

use tracing::{debug, info, warn};

#[cfg(feature = "mzmlb")]
use mzdata::io::mzmlb::MzMLbReaderType;
#[cfg(feature = "thermo")]
use mzdata::io::thermo::ThermoRawReaderType;
use mzdata::io::{
    infer_format, infer_from_stream, mgf::MGFReaderType, mzml::MzMLReaderType,
    MassSpectrometryFormat, PreBufferedStream, RestartableGzDecoder, StreamingSpectrumIterator,
};
use mzdata::prelude::*;

use mzquant::evidence::{read_evidence_file, DEFAULT_SCORE_FIELD};
use mzquant::{IsotopologueLibrary, MZQuantError, MzTabMetaInfo, Params, Results};

use crate::args::{
    collect_fixed_labels, collect_metabolic_labels, read_molecule_file, FixedLabelArg,
    MetabolicLabelArg,
};
use crate::proc::{collect_progress, prepare_processing};
use crate::time_range::TimeRange;
use crate::types::{CPeak, DPeak, SpectrumType, STDIN_BUFFER_SIZE};

#[derive(Debug, Error)]
pub enum MZQuanterError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("The input file format for {0} was either unknown or not supported ({1:?})")]
    FormatUnknownOrNotSupportedError(String, MassSpectrometryFormat),
    #[error("The input file format from STDIN was either unknown or not supported ({0:?})")]
    FormatUnknownOrNotSupportedErrorStdIn(MassSpectrometryFormat),
    #[error("No molecules were given, pass --molecule, --molecule-file or --evidence-file")]
    NoMoleculesError,
    #[error("Failed to build or write quantification results: {0}")]
    QuantError(
        #[source]
        #[from]
        MZQuantError,
    ),
    #[error("Failed to read the command line: {0}")]
    ArgumentError(
        #[source]
        #[from]
        clap::Error,
    ),
    #[error("Failed to read the configuration: {0}")]
    ConfigurationError(
        #[source]
        #[from]
        figment::Error,
    ),
}

/// The configuration file read from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "mzquanter.toml";

fn default_charges() -> Vec<i32> {
    vec![2]
}

fn default_output_file() -> PathBuf {
    PathBuf::from("-")
}

fn default_threads() -> i32 {
    -1
}

fn default_ms_level() -> u8 {
    1
}

/// Isotopologue matching quantification of mass spectrometry files.
///
/// Build the theoretical isotope patterns of a set of molecules, match them against
/// every spectrum of a file or stream and write out the accepted matches as CSV.
#[derive(Parser, Debug, Clone, Deserialize, Serialize)]
#[command(author, version)]
pub struct MZQuanter {
    /// The path to read the input spectra from, or if '-' is passed, read from STDIN
    #[arg()]
    pub input_file: String,

    /// A molecule to quantify, a peptide like `ELVISLIVES#Oxidation:3` or a formula
    /// like `+C(2)H(6)O(1)`
    #[arg(short = 'm', long = "molecule")]
    #[serde(default)]
    pub molecules: Vec<String>,

    /// A file listing one molecule per line
    #[arg(long = "molecule-file")]
    pub molecule_file: Option<PathBuf>,

    /// The charge states to build patterns for
    #[arg(short = 'z', long = "charge", default_values_t = [2])]
    #[serde(default = "default_charges")]
    pub charges: Vec<i32>,

    /// A metabolic label and the enrichment levels to build, denoted ISOTOPE:LEVEL,LEVEL
    #[arg(long = "metabolic-label", value_name = "ISOTOPE:LEVELS")]
    #[serde(default)]
    pub metabolic_labels: Vec<MetabolicLabelArg>,

    /// A fixed label state of an amino acid, denoted AMINO_ACID:LABEL
    #[arg(
        long = "fixed-label",
        value_name = "AMINO_ACID:LABEL",
        long_help = r#"A fixed label state of an amino acid, denoted AMINO_ACID:LABEL

The label is a modification name or a unimod style composition like
`Label:13C(6)15N(4)`. An empty label, `R:`, is the unlabeled state. Repeat
the argument to give an amino acid several states.
"#
    )]
    #[serde(default)]
    pub fixed_labels: Vec<FixedLabelArg>,

    /// A CSV table of identifications supplying retention times and names for molecules
    #[arg(long = "evidence-file")]
    pub evidence_file: Option<PathBuf>,

    /// The path to write the match table to, or if '-' is passed, write to STDOUT.
    ///
    /// Paths ending in `.gz` are gzip compressed.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,

    /// The path to write the complete results to as JSON
    #[arg(long = "results-json")]
    pub results_json: Option<PathBuf>,

    /// The path to write a peptide level mzTab summary to.
    ///
    /// Retention time windows come from the evidence file, so only molecules with
    /// evidence are reported.
    #[arg(long = "mztab-file")]
    pub mztab_file: Option<PathBuf>,

    /// Minutes to widen each evidence retention time window by on both sides
    #[arg(long = "rt-border-tolerance", default_value_t = 0.0)]
    #[serde(default)]
    pub rt_border_tolerance: f64,

    #[arg(skip)]
    #[serde(default)]
    pub mztab_meta_info: MzTabMetaInfo,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `mzquanter.toml` in the working directory.
    /// Environment variables prefixed with `MZQUANTER_` will be read too. Library
    /// parameters go in a `[params]` table, e.g. `M_SCORE_THRESHOLD = 0.7`.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(
        short='t',
        long="threads",
        default_value_t=-1,
    )]
    #[serde(default = "default_threads")]
    pub threads: i32,

    /// The time range to process, denoted (start?)-(stop?)
    #[arg(
        short='r',
        long="time-range",
        value_parser=TimeRange::from_str,
        value_name="BEGIN-END",
        long_help=r#"The time range to process in minutes, denoted (start?)-(stop?)

If a start is not specified, processing begins from the start of the run.
If a stop is not specified, processing stops at the end of the run.
"#
    )]
    pub time_range: Option<TimeRange>,

    /// The MS level of the spectra to match, 0 matches all levels
    #[arg(long = "ms-level", default_value_t = 1)]
    #[serde(default = "default_ms_level")]
    pub ms_level: u8,

    #[arg(skip)]
    #[serde(default)]
    pub params: Params,
}

impl MZQuanter {
    /// Read the options in `matches` and layer the configuration sources over them.
    ///
    /// Defaults are overridden by [`DEFAULT_CONFIG_FILE`], then by `--config-file`,
    /// then by `MZQUANTER_` environment variables. Options given on the command
    /// line override all of them.
    pub fn configure_from(matches: &ArgMatches) -> Result<Self, MZQuanterError> {
        let args = Self::from_arg_matches(matches)?;
        let explicit: Vec<&str> = matches
            .ids()
            .map(|id| id.as_str())
            .filter(|id| matches.value_source(id) == Some(ValueSource::CommandLine))
            .collect();

        let mut config =
            Figment::from(Serialized::defaults(&args)).merge(Toml::file(DEFAULT_CONFIG_FILE));
        if let Some(path) = args.config_file.as_ref() {
            config = config.merge(Toml::file_exact(path));
        }
        config = config.merge(Env::prefixed("MZQUANTER_"));

        let given: Dict = Figment::from(Serialized::defaults(&args)).extract()?;
        for (key, value) in given {
            if explicit.contains(&key.as_str()) {
                config = config.merge(Serialized::default(&key, value));
            }
        }
        Ok(config.extract()?)
    }

    fn create_threadpool(&self) -> Result<rayon::ThreadPool, MZQuanterError> {
        let num_threads = if self.threads > 0 {
            self.threads as usize
        } else {
            thread::available_parallelism().map(usize::from).unwrap_or(1)
        };
        debug!("Using {} cores", num_threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e).into())
    }

    /// The name recorded for each match, the input's file name
    pub fn file_name(&self) -> String {
        if self.input_file == "-" {
            return "STDIN".to_string();
        }
        Path::new(&self.input_file)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.input_file.clone())
    }

    pub fn build_library(&self) -> Result<IsotopologueLibrary, MZQuanterError> {
        let mut molecules = self.molecules.clone();
        if let Some(path) = self.molecule_file.as_ref() {
            let from_file = read_molecule_file(path)?;
            debug!("Read {} molecules from {}", from_file.len(), path.display());
            molecules.extend(from_file);
        }
        if molecules.is_empty() && self.evidence_file.is_none() {
            return Err(MZQuanterError::NoMoleculesError);
        }

        let mut builder = IsotopologueLibrary::builder()
            .molecules(molecules)
            .charges(self.charges.iter().copied())
            .metabolic_labels(collect_metabolic_labels(&self.metabolic_labels))
            .fixed_labels(collect_fixed_labels(&self.fixed_labels))
            .params(self.params.clone());
        if let Some(path) = self.evidence_file.as_ref() {
            let evidences = read_evidence_file(path, DEFAULT_SCORE_FIELD)?;
            info!(
                "Read evidence for {} molecules from {}",
                evidences.len(),
                path.display()
            );
            builder = builder.evidences(evidences);
        }
        let library = builder.build()?;
        info!(
            "Built {} isotopologues for {} formulas",
            library.match_entries().len(),
            library.len()
        );
        Ok(library)
    }

    pub fn main(&self) -> Result<(), MZQuanterError> {
        info!(
            "mzquanter v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());
        let library = self.build_library()?;
        let results = self
            .create_threadpool()?
            .install(|| self.reader_then(&library))?;
        self.write_results(&results)
    }

    fn reader_then(&self, library: &IsotopologueLibrary) -> Result<Results, MZQuanterError> {
        let results = if self.input_file == "-" {
            let mut buffered =
                PreBufferedStream::new_with_buffer_size(io::stdin(), STDIN_BUFFER_SIZE)?;
            let (ms_format, compressed) = infer_from_stream(&mut buffered)?;
            debug!("Detected {ms_format:?} from STDIN (compressed? {compressed})");
            match ms_format {
                MassSpectrometryFormat::MGF => {
                    if compressed {
                        let reader = StreamingSpectrumIterator::new(MGFReaderType::new(
                            RestartableGzDecoder::new(io::BufReader::new(buffered)),
                        ));
                        self.run_workflow(reader, library)
                    } else {
                        let reader = StreamingSpectrumIterator::new(MGFReaderType::new(buffered));
                        self.run_workflow(reader, library)
                    }
                }
                MassSpectrometryFormat::MzML => {
                    if compressed {
                        let reader = StreamingSpectrumIterator::new(MzMLReaderType::new(
                            RestartableGzDecoder::new(io::BufReader::new(buffered)),
                        ));
                        self.run_workflow(reader, library)
                    } else {
                        let reader = StreamingSpectrumIterator::new(MzMLReaderType::new(buffered));
                        self.run_workflow(reader, library)
                    }
                }
                _ => {
                    return Err(MZQuanterError::FormatUnknownOrNotSupportedErrorStdIn(
                        ms_format,
                    ))
                }
            }
        } else {
            let (ms_format, compressed) = infer_format(&self.input_file)?;
            debug!("Detected {ms_format:?} from path (compressed? {compressed})");
            match ms_format {
                MassSpectrometryFormat::MGF => {
                    if compressed {
                        let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                            &self.input_file,
                        )?));
                        let reader = StreamingSpectrumIterator::new(MGFReaderType::new(fh));
                        self.run_workflow(reader, library)
                    } else {
                        let reader = MGFReaderType::open_path(self.input_file.clone())?;
                        self.run_workflow(reader, library)
                    }
                }
                MassSpectrometryFormat::MzML => {
                    if compressed {
                        let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                            &self.input_file,
                        )?));
                        let reader = StreamingSpectrumIterator::new(MzMLReaderType::new(fh));
                        self.run_workflow(reader, library)
                    } else {
                        let reader = MzMLReaderType::open_path(self.input_file.clone())?;
                        self.run_workflow(reader, library)
                    }
                }
                #[cfg(feature = "mzmlb")]
                MassSpectrometryFormat::MzMLb => {
                    let reader = MzMLbReaderType::open_path(self.input_file.clone())?;
                    self.run_workflow(reader, library)
                }
                #[cfg(feature = "thermo")]
                MassSpectrometryFormat::ThermoRaw => {
                    let reader = ThermoRawReaderType::open_path(self.input_file.clone())?;
                    self.run_workflow(reader, library)
                }
                _ => {
                    return Err(MZQuanterError::FormatUnknownOrNotSupportedError(
                        self.input_file.clone(),
                        ms_format,
                    ))
                }
            }
        };
        Ok(results)
    }

    fn run_workflow<R: RandomAccessSpectrumIterator<CPeak, DPeak, SpectrumType> + Send>(
        &self,
        reader: R,
        library: &IsotopologueLibrary,
    ) -> Results {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let file_name = self.file_name();

        let (results, prog) = thread::scope(|scope| {
            let collector = scope.spawn(move || collect_progress(receiver));
            let outcome = prepare_processing(
                reader,
                library,
                &file_name,
                self.ms_level,
                self.time_range,
                sender,
            );
            match collector.join() {
                Ok(seen) => debug!("Collected {seen} spectrum records"),
                Err(e) => warn!("Failed to join progress collector: {e:?}"),
            }
            outcome
        });

        info!("Spectra: {}", prog.spectra);
        info!(
            "Spectra With Matches: {} | Not Centroided: {}",
            prog.spectra_with_matches, prog.spectra_not_centroided
        );
        info!("Peaks: {}", prog.peaks);
        info!("Matches: {}", prog.matches);
        results
    }

    fn write_results(&self, results: &Results) -> Result<(), MZQuanterError> {
        if results.is_empty() {
            warn!("No isotopologue was matched");
        }
        if self.output_file == PathBuf::from("-") {
            let stdout = io::stdout();
            results.write_result_csv_to(stdout.lock())?;
        } else if self
            .output_file
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
        {
            let handle = io::BufWriter::new(fs::File::create(&self.output_file)?);
            let mut encoder = GzEncoder::new(handle, Compression::best());
            results.write_result_csv_to(&mut encoder)?;
            encoder.finish()?;
            info!(
                "Wrote {} matches to {}",
                results.num_matches(),
                self.output_file.display()
            );
        } else {
            results.write_result_csv(&self.output_file)?;
        }
        if let Some(path) = self.results_json.as_ref() {
            results.save_json(path)?;
            info!("Wrote results to {}", path.display());
        }
        if let Some(path) = self.mztab_file.as_ref() {
            results.write_result_mztab(path, &self.mztab_meta_info, self.rt_border_tolerance)?;
        }
        Ok(())
    }
}
