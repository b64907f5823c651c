use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;

use tracing::{debug, info, trace, warn};

use mzdata::prelude::*;
use mzdata::spectrum::SignalContinuity;

use mzquant::{IsotopologueLibrary, Results};

use crate::progress::{ProgressRecord, SpectrumMatchRecord};
use crate::time_range::TimeRange;
use crate::types::{CPeak, SpectrumType, PROGRESS_INTERVAL};

/// Get the centroided peaks of `scan`, picking peaks first if the spectrum is in
/// profile mode
fn centroid_peaks(scan: &mut SpectrumType) -> Option<&[CPeak]> {
    match scan.signal_continuity() {
        SignalContinuity::Profile => {
            if let Err(e) = scan.pick_peaks(1.0) {
                debug!("Peak picking failed: {e}");
                return None;
            }
            scan.description_mut().signal_continuity = SignalContinuity::Centroid;
            scan.peaks.as_ref().map(|peaks| peaks.as_slice())
        }
        _ => match scan.try_build_centroids() {
            Ok(peaks) => Some(peaks.as_slice()),
            Err(e) => {
                debug!("Could not build centroids: {e}");
                None
            }
        },
    }
}

/// Match a single spectrum against `library`, adding matches to `results`
pub fn match_spectrum(
    library: &IsotopologueLibrary,
    file_name: &str,
    index: usize,
    mut scan: SpectrumType,
    results: &mut Results,
) -> (ProgressRecord, SpectrumMatchRecord) {
    let rt = scan.start_time();
    let spec_id = scan.id().to_string();
    let mut prog = ProgressRecord {
        spectra: 1,
        ..Default::default()
    };
    let (n_peaks, n_matches) = match centroid_peaks(&mut scan) {
        Some(peaks) => {
            let n_matches = library.match_all(peaks, file_name, &spec_id, rt, results);
            (peaks.len(), n_matches)
        }
        None => {
            warn!("Failed to centroid {spec_id}, skipping it");
            prog.spectra_not_centroided = 1;
            (0, 0)
        }
    };
    prog.peaks = n_peaks;
    prog.matches = n_matches;
    if n_matches > 0 {
        prog.spectra_with_matches = 1;
    }
    let record = SpectrumMatchRecord {
        index,
        spec_id,
        rt,
        peaks: n_peaks,
        matches: n_matches,
    };
    (prog, record)
}

/// Match every selected spectrum of `reader` in parallel.
///
/// Each rayon worker folds into its own [`Results`] and the partial results are
/// merged once the reader is exhausted. A [`SpectrumMatchRecord`] is sent for every
/// spectrum processed.
pub fn prepare_processing<R: Iterator<Item = SpectrumType> + Send>(
    reader: R,
    library: &IsotopologueLibrary,
    file_name: &str,
    ms_level: u8,
    time_range: Option<TimeRange>,
    sender: Sender<SpectrumMatchRecord>,
) -> (Results, ProgressRecord) {
    let init_counter = AtomicU32::new(0);
    let started = Instant::now();

    let time_range = time_range.unwrap_or_default();
    if time_range.start > 0.0 {
        info!("Starting from {}", time_range.start);
    }

    let (results, prog) = reader
        .skip_while(|scan| scan.start_time() < time_range.start)
        .take_while(|scan| scan.start_time() <= time_range.end)
        .filter(|scan| ms_level == 0 || scan.ms_level() == ms_level)
        .enumerate()
        .par_bridge()
        .fold(
            || {
                init_counter.fetch_add(1, Ordering::AcqRel);
                (library.results(), ProgressRecord::default())
            },
            |(mut results, prog), (index, scan)| {
                let (step, record) = match_spectrum(library, file_name, index, scan, &mut results);
                if let Err(e) = sender.send(record) {
                    warn!("Failed to send spectrum record: {}", e);
                }
                (results, prog + step)
            },
        )
        .reduce(
            || (library.results(), ProgressRecord::default()),
            |(mut results, prog), (other, other_prog)| {
                results.merge(other);
                (results, prog + other_prog)
            },
        );

    let elapsed = Instant::now() - started;
    debug!(
        "{} workers run for matching",
        init_counter.load(Ordering::SeqCst)
    );
    let spectra_per_second = prog.spectra as f64 / elapsed.as_secs_f64().max(1e-9);
    info!(
        "Elapsed Time: {:0.3?} ({:0.2} spectra/sec)",
        elapsed, spectra_per_second
    );
    (results, prog)
}

/// Drain spectrum records, logging periodically, until every sender is dropped.
/// Returns the number of records seen.
pub fn collect_progress(receiver: Receiver<SpectrumMatchRecord>) -> usize {
    let mut seen = 0usize;
    let mut last_rt = 0.0f64;
    for record in receiver.iter() {
        seen += 1;
        last_rt = last_rt.max(record.rt);
        if tracing::enabled!(tracing::Level::TRACE) {
            let tid = thread::current().id();
            trace!(
                "{tid:?}: {} ({}) @ {:0.3} had {} peaks and {} matches",
                record.spec_id,
                record.index,
                record.rt,
                record.peaks,
                record.matches
            );
        }
        if seen % PROGRESS_INTERVAL == 0 {
            info!("Processed {seen} spectra, up to {last_rt:0.3} minutes");
        }
    }
    seen
}
