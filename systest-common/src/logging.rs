//! Logging setup shared by the supervisor and worker processes.
//!
//! Besides the console and the optional run-wide file, every event inside a
//! `module` span is copied to that module's own log in its workspace, see
//! [`ModuleLogLayer`].

use std::fmt::{self as stdfmt, Write as _};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::errors::{HarnessError, HarnessResult};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "compact" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `systest=debug,systest::script=warn`.
    pub level: String,
    pub format: LogFormat,
    /// Also write JSON logs to this file.
    pub file: Option<PathBuf>,
    /// Console logs go to stderr instead of stdout.
    pub stderr: bool,
}

impl LogConfig {
    /// Read `SYSTEST_LOG_LEVEL`, `SYSTEST_LOG_FORMAT` and `SYSTEST_LOG_FILE`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("SYSTEST_LOG_LEVEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        let format = std::env::var("SYSTEST_LOG_FORMAT")
            .ok()
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        let file = std::env::var_os("SYSTEST_LOG_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self {
            level,
            format,
            file,
            stderr: false,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

/// Keeps background log writers alive; hold for the process lifetime.
#[must_use]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> HarnessResult<LoggingGuards> {
    let filter = EnvFilter::try_new(&config.level).map_err(|err| {
        HarnessError::Config(format!("invalid log level '{}': {err}", config.level))
    })?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match (config.format, config.stderr) {
        (LogFormat::Pretty, true) => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
        (LogFormat::Pretty, false) => fmt::layer().compact().boxed(),
        (LogFormat::Json, true) => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        (LogFormat::Json, false) => fmt::layer().json().boxed(),
    });
    layers.push(ModuleLogLayer.boxed());

    let mut file_guard = None;
    if let Some(path) = &config.file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path.file_name().ok_or_else(|| {
            HarnessError::Config(format!("log file {} has no file name", path.display()))
        })?;
        std::fs::create_dir_all(&dir).map_err(|err| {
            HarnessError::io(format!("creating log directory {}", dir.display()), err)
        })?;
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(writer)
                .boxed(),
        );
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|err| HarnessError::Config(format!("failed to initialize logging: {err}")))?;

    Ok(LoggingGuards { _file: file_guard })
}

/// Name of the span the lifecycle driver opens around each module.
pub const MODULE_SPAN: &str = "module";
/// Span field holding the module log path, recorded once the workspace exists.
pub const LOG_FILE_FIELD: &str = "log_file";

/// Copies events inside a [`MODULE_SPAN`] to the file named by its
/// [`LOG_FILE_FIELD`], one plain text line per event.
///
/// The file is opened when the field is recorded and closed when the span
/// closes. Events before that moment only reach the other layers, as do all
/// events when the file cannot be opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleLogLayer;

/// Span extension holding an open module log.
struct ModuleLog(Mutex<RollingFileAppender>);

impl ModuleLogLayer {
    fn attach<S>(&self, id: &Id, path: Option<PathBuf>, ctx: &Context<'_, S>)
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let (Some(path), Some(span)) = (path, ctx.span(id)) else {
            return;
        };
        if span.metadata().name() != MODULE_SPAN {
            return;
        }
        if let Some(appender) = open_module_log(&path) {
            span.extensions_mut().replace(ModuleLog(Mutex::new(appender)));
        }
    }
}

impl<S> Layer<S> for ModuleLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = LogFileVisitor::default();
        attrs.record(&mut visitor);
        self.attach(id, visitor.path, &ctx);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = LogFileVisitor::default();
        values.record(&mut visitor);
        self.attach(id, visitor.path, &ctx);
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        for span in scope {
            let extensions = span.extensions();
            let Some(log) = extensions.get::<ModuleLog>() else {
                continue;
            };
            let line = format_line(event);
            if let Ok(mut appender) = log.0.lock() {
                let _ = appender.write_all(line.as_bytes());
            }
            return;
        }
    }
}

fn open_module_log(path: &Path) -> Option<RollingFileAppender> {
    let dir = path.parent()?;
    let name = path.file_name()?.to_str()?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .ok()
}

fn format_line(event: &Event<'_>) -> String {
    let meta = event.metadata();
    let mut fields = LineVisitor::default();
    event.record(&mut fields);
    format!(
        "{} {:>5} {}: {}{}\n",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        meta.level(),
        meta.target(),
        fields.message,
        fields.rest
    )
}

#[derive(Default)]
struct LogFileVisitor {
    path: Option<PathBuf>,
}

impl Visit for LogFileVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == LOG_FILE_FIELD {
            self.path = Some(PathBuf::from(value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        if field.name() == LOG_FILE_FIELD {
            self.path = Some(PathBuf::from(format!("{value:?}")));
        }
    }
}

/// Event message plus its other fields as ` key=value`.
#[derive(Default)]
struct LineVisitor {
    message: String,
    rest: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.rest, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.rest, " {}={value:?}", field.name());
        }
    }
}
