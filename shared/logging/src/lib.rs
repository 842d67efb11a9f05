use std::{fs::OpenOptions, path::PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Terminal format for a run's log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogOutput {
    #[default]
    Console,
    /// One flattened JSON object per event on stdout.
    Json,
    None,
}

/// Filter directives for the log file, read instead of `RUST_LOG`.
pub const FILE_FILTER_ENV: &str = "WRITE_RUST_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    log_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            log_file: None,
        }
    }
}

impl LoggingBuilder {
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Level used when the filter variable is unset.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Appends ANSI-free lines to `path` as well, filtered by [`FILE_FILTER_ENV`].
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.log_file = path.into();
        self
    }

    /// The configured subscriber, not yet installed.
    pub fn build(self) -> anyhow::Result<impl Subscriber + Send + Sync> {
        let mut layers: Vec<BoxedLayer> = Vec::new();
        if let Some(layer) = self.terminal_layer()? {
            layers.push(layer);
        }
        if let Some(layer) = self.file_layer()? {
            layers.push(layer);
        }
        Ok(tracing_subscriber::registry().with(layers))
    }

    /// Installs the subscriber for the whole process. Fails if one is already installed.
    pub fn init(self) -> anyhow::Result<()> {
        tracing::subscriber::set_global_default(self.build()?)
            .context("a global tracing subscriber is already installed")
    }

    fn filter(&self, env_var: &str) -> anyhow::Result<EnvFilter> {
        EnvFilter::builder()
            .with_default_directive(self.level.into())
            .with_env_var(env_var)
            .from_env()
            .with_context(|| format!("invalid filter directives in {env_var}"))
    }

    fn terminal_layer(&self) -> anyhow::Result<Option<BoxedLayer>> {
        let layer = match self.output {
            LogOutput::None => return Ok(None),
            LogOutput::Console => fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(self.filter(EnvFilter::DEFAULT_ENV)?)
                .boxed(),
            LogOutput::Json => fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_writer(std::io::stdout)
                .with_filter(self.filter(EnvFilter::DEFAULT_ENV)?)
                .boxed(),
        };
        Ok(Some(layer))
    }

    fn file_layer(&self) -> anyhow::Result<Option<BoxedLayer>> {
        let Some(path) = &self.log_file else {
            return Ok(None);
        };
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(file)
                .with_filter(self.filter(FILE_FILTER_ENV)?)
                .boxed(),
        ))
    }
}

pub fn logging() -> LoggingBuilder {
    LoggingBuilder::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[test]
    fn file_layer_writes_plain_lines_at_the_configured_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let subscriber = logging()
            .with_output(LogOutput::None)
            .with_level(Level::INFO)
            .with_log_file(path.clone())
            .build()
            .unwrap();

        tracing::subscriber::with_default(subscriber, || {
            info!(step = 3, "sequence length grew");
            debug!("too detailed for the file");
            warn!("eval split is short");
        });

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("sequence length grew"));
        assert!(written.contains("step=3"));
        assert!(written.contains("eval split is short"));
        assert!(!written.contains("too detailed"));
        assert!(!written.contains('\u{1b}'), "file lines carry no ANSI escapes");
    }

    #[test]
    fn unopenable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = logging()
            .with_output(LogOutput::None)
            .with_log_file(dir.path().join("missing").join("run.log"))
            .build();
        assert!(result.is_err());
    }
}
