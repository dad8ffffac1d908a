// Local crates
use crate::buffer::buffer::EventBuffer;
use crate::helpers::log_processing::EventProcessor;
use crate::input::Input;
use crate::input::ratelimit::RateLimiter;
use crate::model::event::{FieldValue, LogEvent};

// External crates
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const UDP_MAX_DATAGRAM: usize = 65_536;

lazy_static! {
    // <PRI>Mmm dd hh:mm:ss host tag[pid]: message
    static ref RFC3164: Regex = Regex::new(
        r"^<(?P<pri>\d{1,3})>(?P<timestamp>[A-Z][a-z]{2}\s+\d{1,2} \d{2}:\d{2}:\d{2}) (?P<hostname>\S+) (?P<program>[^:\[\s]+)(?:\[(?P<pid>\d+)\])?:?\s?(?P<message>.*)$"
    ).expect("static pattern");
    // <PRI>VERSION TIMESTAMP HOST APP PROCID MSGID [SD] message
    static ref RFC5424: Regex = Regex::new(
        r"^<(?P<pri>\d{1,3})>(?P<version>\d) (?P<timestamp>\S+) (?P<hostname>\S+) (?P<appname>\S+) (?P<procid>\S+) (?P<msgid>\S+) (?:\[.*?\]|-)\s?(?P<message>.*)$"
    ).expect("static pattern");
}

fn default_rate_limit() -> f64 {
    1000.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyslogConfig {
    /// Newline-delimited stream listener, e.g. `0.0.0.0:1514`.
    pub tcp_addr: Option<String>,
    /// One-message-per-datagram listener.
    pub udp_addr: Option<String>,
    /// Sustained messages per second allowed per remote address.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
}

/// Syslog input: RFC 3164 and RFC 5424 over TCP and/or UDP, rate-limited
/// per remote address, feeding parsed events into the shared buffer.
pub struct SyslogInput {
    config: SyslogConfig,
    buffer: Arc<EventBuffer>,
    processor: Arc<EventProcessor>,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    healthy: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyslogInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyslogInput")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyslogInput {
    pub fn new(
        config: SyslogConfig,
        buffer: Arc<EventBuffer>,
        processor: Arc<EventProcessor>,
        cancel: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, None));
        limiter.start_pruner(cancel.clone());
        Self {
            config,
            buffer,
            processor,
            limiter,
            cancel,
            healthy: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn accept_tcp(&self, listener: TcpListener) -> JoinHandle<()> {
        let buffer = Arc::clone(&self.buffer);
        let processor = Arc::clone(&self.processor);
        let limiter = Arc::clone(&self.limiter);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let (stream, remote) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(error = %e, "Syslog TCP accept failed");
                            continue;
                        }
                    },
                };
                tracing::debug!(%remote, "Syslog TCP connection opened");
                let buffer = Arc::clone(&buffer);
                let processor = Arc::clone(&processor);
                let limiter = Arc::clone(&limiter);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    loop {
                        let line = tokio::select! {
                            _ = cancel.cancelled() => break,
                            line = lines.next_line() => match line {
                                Ok(Some(line)) => line,
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::debug!(%remote, error = %e, "Syslog TCP read error");
                                    break;
                                }
                            },
                        };
                        if !limiter.allow(remote.ip()) {
                            continue;
                        }
                        let event = parse_syslog(&line, remote);
                        let event = processor.process_event(event);
                        if buffer.send(event).await.is_err() {
                            break;
                        }
                    }
                    tracing::debug!(%remote, "Syslog TCP connection closed");
                });
            }
        })
    }

    async fn serve_udp(&self, socket: UdpSocket) -> JoinHandle<()> {
        let buffer = Arc::clone(&self.buffer);
        let processor = Arc::clone(&self.processor);
        let limiter = Arc::clone(&self.limiter);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut datagram = vec![0u8; UDP_MAX_DATAGRAM];
            loop {
                let (len, remote) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut datagram) => match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(error = %e, "Syslog UDP receive failed");
                            continue;
                        }
                    },
                };
                if !limiter.allow(remote.ip()) {
                    continue;
                }
                let message = String::from_utf8_lossy(&datagram[..len]);
                let event = parse_syslog(message.trim_end_matches(['\r', '\n']), remote);
                let event = processor.process_event(event);
                if buffer.send(event).await.is_err() {
                    break;
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl Input for SyslogInput {
    fn name(&self) -> &'static str {
        "syslog"
    }

    async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(addr) = &self.config.tcp_addr {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding syslog tcp listener on {addr}"))?;
            tracing::info!(%addr, "Syslog TCP listener bound");
            tasks.push(self.accept_tcp(listener).await);
        }
        if let Some(addr) = &self.config.udp_addr {
            let socket = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("binding syslog udp socket on {addr}"))?;
            tracing::info!(%addr, "Syslog UDP socket bound");
            tasks.push(self.serve_udp(socket).await);
        }
        self.healthy.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        self.healthy.store(false, Ordering::Release);
        tracing::info!("Syslog input stopped");
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Map the PRI severity (low three bits) onto the canonical level set.
fn severity_level(pri: u32) -> &'static str {
    match pri & 0x7 {
        0..=2 => "fatal",
        3 => "error",
        4 => "warn",
        5 | 6 => "info",
        _ => "debug",
    }
}

/// Parse one syslog message, trying RFC 5424 then RFC 3164. Anything else
/// becomes a plain event so no datagram is ever dropped for shape alone.
pub fn parse_syslog(line: &str, remote: SocketAddr) -> LogEvent {
    let source = remote.to_string();

    if let Some(caps) = RFC5424.captures(line) {
        let mut event = LogEvent::from_line(&source, line);
        event.message = caps["message"].to_string();
        if let Ok(pri) = caps["pri"].parse::<u32>() {
            event.level = Some(severity_level(pri).to_string());
            event
                .fields
                .insert("facility".into(), FieldValue::Integer((pri >> 3) as i64));
        }
        if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(&caps["timestamp"]) {
            event.timestamp = ts.with_timezone(&chrono::Utc);
        }
        event
            .fields
            .insert("hostname".into(), caps["hostname"].into());
        for (capture, field) in [("appname", "program"), ("procid", "pid"), ("msgid", "msgid")] {
            match caps.name(capture).map(|m| m.as_str()) {
                Some("-") | None => {}
                Some(value) => {
                    event.fields.insert(field.into(), value.into());
                }
            }
        }
        return event;
    }

    if let Some(caps) = RFC3164.captures(line) {
        let mut event = LogEvent::from_line(&source, line);
        event.message = caps["message"].to_string();
        if let Ok(pri) = caps["pri"].parse::<u32>() {
            event.level = Some(severity_level(pri).to_string());
            event
                .fields
                .insert("facility".into(), FieldValue::Integer((pri >> 3) as i64));
        }
        event
            .fields
            .insert("hostname".into(), caps["hostname"].into());
        event.fields.insert("program".into(), caps["program"].into());
        if let Some(pid) = caps.name("pid") {
            event.fields.insert("pid".into(), pid.as_str().into());
        }
        return event;
    }

    LogEvent::from_line(&source, line)
}
