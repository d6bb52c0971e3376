//! The request log: line composition and pluggable sinks.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::sync::mpsc;
use tracing::info;

use crate::component::Component;
use crate::Error;

/// Characters escaped inside the quoted URL column: controls, the quote
/// itself, and backslash, so a line always splits on unescaped spaces.
const URL_ESCAPES: &AsciiSet = &CONTROLS.add(b'"').add(b'\\').add(b' ');

/// Where completed-request lines go. The on-disk writer is external; sinks
/// receive fully formatted lines.
///
/// `now` exists so a sink can supply a virtual clock for the timestamp
/// column; the default reads the system clock.
pub trait RequestLogSink: Component {
    fn log_completed_request(&self, line: String);

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Everything one access-log line records.
#[derive(Debug)]
pub struct CompletedRequest<'a> {
    pub remote: SocketAddr,
    pub method: &'a http::Method,
    pub url: &'a str,
    pub status: http::StatusCode,
    pub response_bytes: u64,
    pub duration: Duration,
    pub error_code: Option<&'a str>,
}

impl CompletedRequest<'_> {
    /// Renders the single log line:
    /// `timestamp remote method "url" status bytes duration error-code`.
    pub fn render(&self, at: SystemTime) -> String {
        let duration = Duration::from_millis(self.duration.as_millis() as u64);
        format!(
            "{} {} {} \"{}\" {} {} {} {}",
            humantime::format_rfc3339_millis(at),
            self.remote.ip(),
            self.method,
            utf8_percent_encode(self.url, URL_ESCAPES),
            self.status.as_u16(),
            self.response_bytes,
            humantime::format_duration(duration),
            self.error_code.unwrap_or("-"),
        )
    }
}

/// The default sink: emits lines as `tracing` events under the
/// `whey::access` target.
pub struct TracingLogSink {
    name: String,
}

impl TracingLogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Component for TracingLogSink {
    fn name(&self) -> &str {
        &self.name
    }
}

impl RequestLogSink for TracingLogSink {
    fn log_completed_request(&self, line: String) {
        info!(target: "whey::access", "{line}");
    }
}

/// A sink that hands lines to a channel, for external writers and tests.
/// Lines logged while no receiver is listening are dropped.
pub struct ChannelLogSink {
    name: String,
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelLogSink {
    pub fn pair(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Component for ChannelLogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn impl_stop(&self, _will_reload: bool) -> Result<(), Error> {
        Ok(())
    }
}

impl RequestLogSink for ChannelLogSink {
    fn log_completed_request(&self, line: String) {
        let _ = self.tx.send(line);
    }
}

impl fmt::Debug for TracingLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingLogSink")
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Debug for ChannelLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLogSink")
            .field("name", &self.name)
            .finish()
    }
}
