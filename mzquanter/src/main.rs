use std::fs;
use std::io;
use std::path::Path;

use clap::CommandFactory;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mzquanter::{MZQuanter, MZQuanterError};

#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn configure_log(log_file: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(fs::File::create(path)?);
            let layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_timer(fmt::time::ChronoLocal::rfc_3339())
                .with_writer(writer)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(tracing::Level::INFO.into())
                        .from_env_lossy(),
                );
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_timer(fmt::time::ChronoLocal::rfc_3339())
                .with_writer(io::stderr)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(tracing::Level::INFO.into())
                        .from_env_lossy(),
                ),
        )
        .with(file_layer)
        .init();
    Ok(guard)
}

fn main() -> Result<(), MZQuanterError> {
    let matches = MZQuanter::command().get_matches();
    let args = MZQuanter::configure_from(&matches)?;

    let _guard = configure_log(args.log_file.as_deref())?;
    if tracing::enabled!(tracing::Level::DEBUG) {
        match toml::to_string_pretty(&args) {
            Ok(text) => debug!("Configuration:\n{text}"),
            Err(e) => debug!("Failed to render the configuration: {e}"),
        }
    }
    args.main()?;
    Ok(())
}
