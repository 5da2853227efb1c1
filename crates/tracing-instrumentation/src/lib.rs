// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tracing::{Level, info};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

use corral_types::config::{LogFormat, LoggingOptions};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot parse log filter: {0}")]
    LogDirectiveParseError(#[from] ParseError),
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
    #[error("cannot reload log filter: {0}")]
    Reload(#[from] tracing_subscriber::reload::Error),
}

fn build_logging_layer<S>(options: &LoggingOptions) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let ansi = !options.log_disable_ansi_codes;
    match options.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(
                // WARN and ERROR go to stderr, everything else to stdout
                std::io::stderr
                    .with_max_level(Level::WARN)
                    .or_else(std::io::stdout),
            )
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(ansi)
            .boxed(),
    }
}

/// Installs the process-wide subscriber. The log filter can be changed later on through the
/// returned [`LoggingGuard`].
///
/// Fails if the filter doesn't parse or if a global subscriber is installed already.
pub fn init_logging(options: &LoggingOptions) -> Result<LoggingGuard, LoggingError> {
    let filter = EnvFilter::try_new(&options.log_filter)?;
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(build_logging_layer(options).with_filter(filter))
        .try_init()?;

    Ok(LoggingGuard { reload_handle })
}

#[derive(Debug)]
pub struct LoggingGuard {
    reload_handle: Handle<EnvFilter, Registry>,
}

impl LoggingGuard {
    pub fn reload_log_filter(&self, log_filter: &str) -> Result<(), LoggingError> {
        let new_filter = EnvFilter::try_new(log_filter)?;
        self.reload_handle.modify(|filter| *filter = new_filter)?;
        info!("Log filter set to '{log_filter}'");
        Ok(())
    }
}
