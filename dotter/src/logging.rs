//! Log output construction.
//!
//! dotter writes two kinds of lines to one [`Output`]: diagnostics, through a
//! `tracing` subscriber filtered by level, and emitted records, written
//! directly by the emitter so that every write error is seen and no level
//! filter can hide a counted record. The output is stdout, or a rotating file
//! when a path is configured.

use std::{
    fmt, io,
    num::NonZeroUsize,
    panic,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{Level, Subscriber, error, level_filters::LevelFilter};
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{EnvFilter, fmt::MakeWriter, util::SubscriberInitExt};

/// Errors produced while installing the log output.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured level is not a tracing level.
    #[error("invalid log level: {0:?}")]
    Level(String),
    /// The configured file path has no file name.
    #[error("log file path {} has no file name", .0.display())]
    FileName(PathBuf),
    /// The rolling file appender could not be created.
    #[error("failed to create log file appender: {0}")]
    Appender(#[from] rolling::InitError),
    /// A global subscriber was already installed.
    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// How often the log file is rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Rotation {
    /// Rotate every minute
    Minutely,
    /// Rotate every hour
    Hourly,
    /// Rotate every day
    #[default]
    Daily,
    /// Never rotate
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::Minutely => rolling::Rotation::MINUTELY,
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A rotating log file.
pub struct FileConfig {
    /// Path of the active log file. Rotated files share its name as prefix.
    pub path: PathBuf,
    /// Rotation period
    pub rotation: Rotation,
    /// Rotated files to keep, the oldest are removed beyond this
    pub max_files: NonZeroUsize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Configuration of the log output.
pub struct Config {
    /// Minimum diagnostic level, one of trace, debug, info, warn or error.
    /// `RUST_LOG` directives refine it. Emitted records are not filtered.
    pub level: String,
    /// Annotate diagnostics with source file and line, and color them when
    /// writing to stdout
    pub development: bool,
    /// Log to this file rather than stdout
    pub file: Option<FileConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            development: false,
            file: None,
        }
    }
}

type BoxedWriter = Box<dyn io::Write + Send>;

/// Destination shared by diagnostics and emitted records.
///
/// Clones write to the same underlying writer. Each `write_all` holds the
/// lock for the whole buffer, so lines from different writers never mix.
#[derive(Clone)]
pub struct Output {
    writer: Arc<Mutex<BoxedWriter>>,
}

impl Output {
    /// Wrap `writer`.
    #[must_use]
    pub fn new<W>(writer: W) -> Self
    where
        W: io::Write + Send + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write to the rotating file described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no file name or the directory cannot
    /// be created or written.
    pub fn file(config: &FileConfig) -> Result<Self, Error> {
        Ok(Self::new(appender(config)?))
    }

    /// Open the output described by `config`.
    ///
    /// # Errors
    ///
    /// See [`Output::file`].
    pub fn open(config: &Config) -> Result<Self, Error> {
        match &config.file {
            Some(file) => Self::file(file),
            None => Ok(Self::stdout()),
        }
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, BoxedWriter>> {
        self.writer
            .lock()
            .map_err(|_| io::Error::other("log output lock poisoned"))
    }
}

impl io::Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.lock()?.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl<'a> MakeWriter<'a> for Output {
    type Writer = Output;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output").finish_non_exhaustive()
    }
}

/// Build the level filter for `level`.
///
/// # Errors
///
/// Returns [`Error::Level`] if `level` is not a tracing level.
pub fn filter(level: &str) -> Result<EnvFilter, Error> {
    let level: Level = level
        .trim()
        .parse()
        .map_err(|_| Error::Level(level.to_string()))?;
    Ok(EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy())
}

/// Create the rolling appender described by `config`.
///
/// # Errors
///
/// Returns an error if the path has no file name or the directory cannot be
/// created or written.
pub fn appender(config: &FileConfig) -> Result<RollingFileAppender, Error> {
    let prefix = config
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::FileName(config.path.clone()))?;
    let directory = match config.path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    Ok(RollingFileAppender::builder()
        .rotation(config.rotation.into())
        .filename_prefix(prefix)
        .max_log_files(config.max_files.get())
        .build(directory)?)
}

/// Build the diagnostic subscriber writing to `output`.
///
/// # Errors
///
/// Returns [`Error::Level`] if the configured level is invalid.
pub fn subscriber(
    config: &Config,
    output: Output,
) -> Result<impl Subscriber + Send + Sync + 'static, Error> {
    let filter = filter(&config.level)?;
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(output)
        .with_ansi(config.development && config.file.is_none())
        .with_file(config.development)
        .with_line_number(config.development)
        .finish())
}

/// Report panics through the diagnostic log before the default hook runs.
pub fn log_panics() {
    let default = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        error!(target: "dotter::panic", "{info}");
        default(info);
    }));
}

/// Open the output and install the global subscriber on it.
///
/// With a log file configured panics are logged to it too. The returned
/// [`Output`] is where emitted records belong.
///
/// # Errors
///
/// Returns an error if the level is invalid, the log file cannot be opened or
/// a subscriber is already installed.
pub fn init(config: &Config) -> Result<Output, Error> {
    let output = Output::open(config)?;
    subscriber(config, output.clone())?.try_init()?;
    if config.file.is_some() {
        log_panics();
    }
    Ok(output)
}
