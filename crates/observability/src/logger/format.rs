//! One-JSON-object-per-line event encoding

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    registry::LookupSpan,
};

use crate::config::ServiceIdentity;

/// Boolean field that promotes an error event to `"level":"fatal"`
pub(crate) const FATAL_FIELD: &str = "fatal";

const RESERVED_KEYS: [&str; 6] = ["level", "timestamp", "service", "version", "caller", "msg"];

/// Encodes events as `{level, timestamp, service, version, caller, msg, ...fields}`
///
/// `caller` is `file:line` of the emitting macro and is left out when the
/// event carries no source location.
#[derive(Debug, Clone)]
pub struct JsonRecordFormat {
    service: String,
    version: String,
}

impl JsonRecordFormat {
    pub fn new(service: &ServiceIdentity) -> Self {
        Self {
            service: service.name.clone(),
            version: service.version.clone(),
        }
    }

    fn record(&self, event: &Event<'_>) -> Map<String, Value> {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let level = if visitor.fatal {
            "fatal"
        } else {
            level_name(*event.metadata().level())
        };

        let mut record = Map::new();
        record.insert("level".to_string(), level.into());
        record.insert(
            "timestamp".to_string(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .into(),
        );
        record.insert("service".to_string(), self.service.clone().into());
        record.insert("version".to_string(), self.version.clone().into());
        if let Some(caller) = caller(event) {
            record.insert("caller".to_string(), caller.into());
        }
        record.insert(
            "msg".to_string(),
            visitor.message.unwrap_or_default().into(),
        );
        for (key, value) in visitor.fields {
            if !RESERVED_KEYS.contains(&key) {
                record.insert(key.to_string(), value);
            }
        }
        record
    }
}

impl<S, N> FormatEvent<S, N> for JsonRecordFormat
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
        let line = serde_json::to_string(&self.record(event)).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

fn caller(event: &Event<'_>) -> Option<String> {
    let metadata = event.metadata();
    let file = metadata.file()?;
    Some(match metadata.line() {
        Some(line) => format!("{file}:{line}"),
        None => file.to_string(),
    })
}

const fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        _ => "debug",
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    fatal: bool,
    fields: Vec<(&'static str, Value)>,
}

impl RecordVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(text) => text,
                other => other.to_string(),
            });
        } else {
            self.fields.push((field.name(), value));
        }
    }
}

impl Visit for RecordVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == FATAL_FIELD {
            self.fatal = value;
        } else {
            self.insert(field, value.into());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, value.to_string().into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}").into());
    }
}
