//! Structured logging bootstrap.
//!
//! A [`Logger`] owns its own `tracing` dispatcher instead of installing a
//! process-wide default, so callers hand it to whatever needs to log and run
//! work under [`Logger::scope`].

use std::{
    fmt::Write as _,
    io::{self, Write},
};
use tracing::{Dispatch, Event, Level, Span, Subscriber, dispatcher};
use tracing_subscriber::{
    fmt::{
        FmtContext, FormatEvent, FormatFields, MakeWriter,
        format::{JsonFields, Writer},
    },
    registry::LookupSpan,
};

use crate::config::LoggerConfig;

type Closer = Box<dyn FnOnce() -> io::Result<()> + Send + Sync>;

/// Name of the span carrying the service tag.
const ROOT_SPAN: &str = "app";

/// Output encoding of log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// `text` selects plain output; anything else, including empty, is JSON.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "text" => LogFormat::Text,
            _ => LogFormat::Json,
        }
    }
}

/// Case-insensitive level name; empty or unknown means `INFO`.
pub fn parse_level(s: &str) -> Level {
    match s.trim().to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Leveled logger tagging every record with the service name.
pub struct Logger {
    dispatch: Dispatch,
    root: Span,
    closer: Option<Closer>,
}

impl Logger {
    /// Logger writing to stdout.
    pub fn new(cfg: &LoggerConfig, service: &str) -> Self {
        Self::with_writer(cfg, service, io::stdout).with_closer(|| io::stdout().flush())
    }

    pub fn with_writer<W>(cfg: &LoggerConfig, service: &str, make_writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let builder = tracing_subscriber::fmt()
            .with_writer(make_writer)
            .with_max_level(parse_level(&cfg.level))
            .with_file(cfg.add_source)
            .with_line_number(cfg.add_source);

        let dispatch = match LogFormat::parse(&cfg.format) {
            LogFormat::Text => Dispatch::new(builder.with_ansi(false).finish()),
            LogFormat::Json => {
                let inner = tracing_subscriber::fmt::format()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_file(cfg.add_source)
                    .with_line_number(cfg.add_source);

                Dispatch::new(
                    builder
                        .fmt_fields(JsonFields::new())
                        .event_format(ServiceJson { inner, service: service.to_owned() })
                        .finish(),
                )
            }
        };

        // ERROR level keeps the span enabled under every filter.
        let root = dispatcher::with_default(&dispatch, || {
            tracing::error_span!(ROOT_SPAN, service = %service)
        });

        Self { dispatch, root, closer: None }
    }

    /// Register the release step for the underlying writer.
    pub fn with_closer<F>(mut self, close: F) -> Self
    where
        F: FnOnce() -> io::Result<()> + Send + Sync + 'static,
    {
        self.closer = Some(Box::new(close));
        self
    }

    /// Run `f` with this logger as the thread's dispatcher, inside the service span.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, || self.root.in_scope(f))
    }

    pub fn debug(&self, msg: &str) {
        self.scope(|| tracing::debug!("{}", msg));
    }

    pub fn info(&self, msg: &str) {
        self.scope(|| tracing::info!("{}", msg));
    }

    pub fn warn(&self, msg: &str) {
        self.scope(|| tracing::warn!("{}", msg));
    }

    pub fn error(&self, msg: &str) {
        self.scope(|| tracing::error!("{}", msg));
    }

    /// Release the writer. Dropping the logger does the same, ignoring errors.
    pub fn shutdown(mut self) -> io::Result<()> {
        self.close()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.closer.take() {
            Some(close) => close(),
            None => Ok(()),
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// JSON event format with `service` as a top-level key.
///
/// The root span is dropped from the record; any inner span stays under `span`.
struct ServiceJson<F> {
    inner: F,
    service: String,
}

impl<S, N, F> FormatEvent<S, N> for ServiceJson<F>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut line = String::new();
        self.inner.format_event(ctx, Writer::new(&mut line), event)?;

        let Ok(serde_json::Value::Object(mut record)) = serde_json::from_str(line.trim_end()) else {
            return writer.write_str(&line);
        };

        let in_root_span = record
            .get("span")
            .and_then(|span| span.get("name"))
            .and_then(serde_json::Value::as_str)
            == Some(ROOT_SPAN);
        if in_root_span {
            record.remove("span");
        }
        record.insert("service".to_owned(), self.service.clone().into());

        writeln!(writer, "{}", serde_json::Value::Object(record))
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("closed", &self.closer.is_none()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }

        fn clear(&self) {
            self.0.lock().unwrap().clear();
        }
    }

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn cfg(level: &str, format: &str) -> LoggerConfig {
        LoggerConfig { level: level.into(), format: format.into(), add_source: false }
    }

    fn capture(cfg: &LoggerConfig, service: &str) -> (Logger, Buffer) {
        let buf = Buffer::default();
        (Logger::with_writer(cfg, service, buf.clone()), buf)
    }

    #[test]
    fn parse_level_names() {
        let cases = [
            ("debug", Level::DEBUG),
            ("DEBUG", Level::DEBUG),
            ("  debug  ", Level::DEBUG),
            ("info", Level::INFO),
            ("INFO", Level::INFO),
            ("", Level::INFO),
            ("warn", Level::WARN),
            ("WARNING", Level::WARN),
            ("error", Level::ERROR),
            ("ERROR", Level::ERROR),
            ("unknown", Level::INFO),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "{input:?}");
        }
    }

    #[test]
    fn parse_format_defaults_to_json() {
        assert_eq!(LogFormat::parse("text"), LogFormat::Text);
        assert_eq!(LogFormat::parse(" TEXT "), LogFormat::Text);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
        assert_eq!(LogFormat::parse("unknown"), LogFormat::Json);
    }

    #[test]
    fn json_output_carries_service_and_fields() {
        let (log, buf) = capture(&cfg("info", "json"), "test-service");

        log.scope(|| tracing::info!(key = "value", "test message"));

        let record: serde_json::Value =
            serde_json::from_str(buf.contents().trim()).expect("output is one JSON record");
        assert_eq!(record["message"], "test message");
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["key"], "value");
        assert_eq!(record["service"], "test-service");
        assert!(record.get("span").is_none(), "root span leaked: {record}");
        assert!(record.get("spans").is_none(), "span list emitted: {record}");
    }

    #[test]
    fn json_service_tag_is_top_level_for_shorthands() {
        let (log, buf) = capture(&cfg("info", "json"), "my-service");

        log.info("test message");

        assert!(buf.contents().contains(r#""service":"my-service""#), "{}", buf.contents());
    }

    #[test]
    fn json_keeps_inner_spans() {
        let (log, buf) = capture(&cfg("info", "json"), "test-service");

        log.scope(|| tracing::info_span!("request", id = 7).in_scope(|| tracing::info!("inner")));

        let record: serde_json::Value = serde_json::from_str(buf.contents().trim()).unwrap();
        assert_eq!(record["service"], "test-service");
        assert_eq!(record["span"]["name"], "request");
        assert_eq!(record["span"]["id"], 7);
    }

    #[test]
    fn text_output_carries_service_and_fields() {
        let (log, buf) = capture(&cfg("info", "text"), "test-service");

        log.scope(|| tracing::info!(key = %"value", "test message"));

        let output = buf.contents();
        for expected in ["INFO", "test message", "service=test-service", "key=value"] {
            assert!(output.contains(expected), "expected {expected:?} in {output}");
        }
    }

    #[test]
    fn level_filtering() {
        let (log, buf) = capture(&cfg("warn", "json"), "test-service");

        log.debug("debug message");
        log.info("info message");
        assert!(buf.contents().is_empty(), "unexpected output: {}", buf.contents());

        log.warn("warn message");
        assert!(buf.contents().contains("warn message"));

        buf.clear();
        log.error("error message");
        assert!(buf.contents().contains("error message"));
    }

    #[test]
    fn add_source_emits_location() {
        let mut config = cfg("info", "json");
        config.add_source = true;
        let (log, buf) = capture(&config, "test-service");

        log.info("located");

        let record: serde_json::Value = serde_json::from_str(buf.contents().trim()).unwrap();
        assert!(record["filename"].as_str().is_some_and(|f| f.ends_with("logger.rs")));
        assert!(record["line_number"].is_number());
    }

    #[test]
    fn source_location_off_by_default() {
        let (log, buf) = capture(&cfg("info", "json"), "test-service");

        log.info("plain");

        let record: serde_json::Value = serde_json::from_str(buf.contents().trim()).unwrap();
        assert!(record.get("filename").is_none());
    }

    #[test]
    fn events_outside_scope_are_not_captured() {
        let (log, buf) = capture(&cfg("info", "json"), "test-service");

        tracing::info!("outside");
        assert!(buf.contents().is_empty());

        log.info("inside");
        assert!(buf.contents().contains("inside"));
    }

    #[test]
    fn shutdown_runs_closer_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (log, _buf) = capture(&cfg("info", "json"), "test-service");
        let log = log.with_closer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        log.shutdown().expect("shutdown");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_writer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (log, _buf) = capture(&cfg("info", "json"), "test-service");
        let log = log.with_closer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        drop(log);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_without_closer_is_ok() {
        let (log, _buf) = capture(&cfg("", ""), "test-service");
        assert!(log.shutdown().is_ok());
    }

    #[test]
    fn stdout_logger_shuts_down() {
        let log = Logger::new(&cfg("error", "json"), "test-service");
        assert!(log.shutdown().is_ok());
    }
}
