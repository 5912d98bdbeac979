//! Process-wide `tracing` setup.
//!
//! Each log line is one JSON object keyed for Cloud Logging ingestion
//! (wrapped here for width):
//!
//! ```json
//! {"severity":"INFO","message":"Message published","timestamp":"...",
//!  "caller":"src/processor/hook.rs:67","tx_id":"abc-1"}
//! ```
//!
//! Event fields other than `message` are flattened next to those keys.

use std::fmt;

use serde_json::{Map, Value};
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
};
use tracing_error::{ErrorLayer, SpanTrace};
use tracing_subscriber::{
    EnvFilter,
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::Writer,
        time::{FormatTime, SystemTime},
    },
    prelude::*,
    registry::LookupSpan,
};

/// Install a JSON `tracing` subscriber for the whole process.
///
/// `level` is the default directive (case-insensitive: `DEBUG`, `info`,
/// `Warn`, ...). `RUST_LOG` still takes precedence when set. Also installs
/// [`ErrorLayer`] so errors capture a [`SpanTrace`].
pub fn init(level: &str) -> Result<(), LoggingError> {
    let level = level_filter(level)?;

    let fmt_layer = tracing_subscriber::fmt::layer().event_format(SeverityJson);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|e| LoggingError::install(e.into()))
}

/// Parse a level name.
pub fn level_filter(text: &str) -> Result<LevelFilter, LoggingError> {
    text.trim()
        .parse()
        .map_err(|_| LoggingError::unknown_level(text))
}

/// Event formatter writing one JSON object per line with `severity`,
/// `message`, `timestamp` and `caller` keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeverityJson;

impl<S, N> FormatEvent<S, N> for SeverityJson
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        let mut timestamp = String::new();
        SystemTime.format_time(&mut Writer::new(&mut timestamp))?;

        let mut fields = JsonFields::default();
        event.record(&mut fields);
        let mut fields = fields.0;

        let mut line = Map::new();
        line.insert("severity".to_owned(), metadata.level().as_str().into());
        line.insert(
            "message".to_owned(),
            fields.remove("message").unwrap_or_default(),
        );
        line.insert("timestamp".to_owned(), timestamp.into());
        if let (Some(file), Some(number)) = (metadata.file(), metadata.line()) {
            line.insert("caller".to_owned(), format!("{file}:{number}").into());
        }
        for (key, value) in fields {
            line.entry(key).or_insert(value);
        }

        let text = serde_json::to_string(&line).map_err(|_| fmt::Error)?;
        writeln!(writer, "{text}")
    }
}

#[derive(Default)]
struct JsonFields(Map<String, Value>);

impl JsonFields {
    fn put(&mut self, field: &Field, value: impl Into<Value>) {
        self.0.insert(field.name().to_owned(), value.into());
    }
}

impl Visit for JsonFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

/// Error returned when logging cannot be set up.
#[derive(Debug)]
pub struct LoggingError {
    context: SpanTrace,
    kind: LoggingErrorKind,
}

/// Logging error kinds.
#[derive(Debug)]
pub enum LoggingErrorKind {
    /// The level name is not recognised.
    UnknownLevel(String),
    /// A global subscriber is already installed.
    Install(tower::BoxError),
}

impl LoggingError {
    fn unknown_level(level: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: LoggingErrorKind::UnknownLevel(level.to_owned()),
        }
    }

    fn install(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: LoggingErrorKind::Install(err),
        }
    }

    pub fn kind(&self) -> &LoggingErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            LoggingErrorKind::UnknownLevel(level) => writeln!(f, "Unknown log level: {level:?}"),
            LoggingErrorKind::Install(err) => writeln!(f, "Subscriber install error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for LoggingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            LoggingErrorKind::UnknownLevel(_) => None,
            LoggingErrorKind::Install(err) => Some(err.as_ref()),
        }
    }
}
