// SPDX-License-Identifier: Apache-2.0

//! UDP statsd destination.
//!
//! Outgoing metric format, one datagram per call:
//!
//! ```text
//! <prefix><name>:<value>|<type>[|#<tag>,<tag>,...]
//! ```
//!
//! e.g.
//!
//! ```text
//! host.web`errors:1|c
//! host.web`errors:1|c|#log_id:nginx
//! host.web`latency:2.5e0|ms
//! host.web`users:abcd123|s
//! host.web`status:ready|t
//! ```
//!
//! Histograms are serialized as `ms`. Integer values use plain decimal
//! formatting, floats use exponent notation. The socket is opened lazily on
//! the first send; a send error drops the socket so the next call reopens it.

use std::net::UdpSocket;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{Error, GaugeValue, Result, Sink, valid_tags};

#[derive(Debug, Clone)]
pub struct StatsdConfig {
    /// Destination id, appended to the prefix with a backtick separator.
    pub id: String,
    /// UDP port on localhost.
    pub port: u16,
    /// Prefix prepended to every metric name.
    pub prefix: String,
}

pub struct Statsd {
    prefix: String,
    addr: (&'static str, u16),
    conn: Mutex<Option<UdpSocket>>,
}

impl Statsd {
    pub fn new(cfg: StatsdConfig) -> Result<Self> {
        if cfg.id.is_empty() {
            return Err(Error::Config("invalid statsd id (empty)".to_string()));
        }
        if cfg.port == 0 {
            return Err(Error::Config("invalid statsd port (0)".to_string()));
        }

        Ok(Self {
            prefix: format!("{}{}`", cfg.prefix, cfg.id),
            addr: ("127.0.0.1", cfg.port),
            conn: Mutex::new(None),
        })
    }

    fn open(&self) -> std::io::Result<UdpSocket> {
        let sock = UdpSocket::bind(("127.0.0.1", 0))?;
        sock.connect(self.addr)?;
        Ok(sock)
    }

    fn send(&self, metric: String) -> Result<()> {
        let mut conn = self.conn.lock().expect("statsd lock poisoned");
        if conn.is_none() {
            *conn = Some(self.open()?);
        }

        let payload = format!("{}{}", self.prefix, metric);
        debug!(metric = %payload, "sending");

        if let Some(sock) = conn.as_ref() {
            if let Err(e) = sock.send(payload.as_bytes()) {
                // drop the socket; the next call reopens it
                *conn = None;
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn send_tagged(&self, metric: String, tags: &[String]) -> Result<()> {
        match join_tags(tags) {
            Some(joined) => self.send(format!("{}|#{}", metric, joined)),
            None => self.send(metric),
        }
    }
}

fn join_tags(tags: &[String]) -> Option<String> {
    let tags = valid_tags(tags);
    if tags.is_empty() {
        None
    } else {
        Some(tags.join(","))
    }
}

fn format_gauge(value: GaugeValue) -> String {
    match value {
        GaugeValue::Int(v) => format!("{}", v),
        GaugeValue::Uint(v) => format!("{}", v),
        GaugeValue::Float(v) => format!("{:e}", v),
    }
}

#[async_trait]
impl Sink for Statsd {
    async fn start(&self) -> Result<()> {
        let mut conn = self.conn.lock().expect("statsd lock poisoned");
        *conn = Some(self.open()?);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut conn = self.conn.lock().expect("statsd lock poisoned");
        conn.take();
        Ok(())
    }

    fn increment_counter(&self, name: &str) -> Result<()> {
        self.increment_counter_by(name, 1)
    }

    fn increment_counter_with_tags(&self, name: &str, tags: &[String]) -> Result<()> {
        self.increment_counter_by_with_tags(name, tags, 1)
    }

    fn increment_counter_by(&self, name: &str, value: u64) -> Result<()> {
        self.send(format!("{}:{}|c", name, value))
    }

    fn increment_counter_by_with_tags(
        &self,
        name: &str,
        tags: &[String],
        value: u64,
    ) -> Result<()> {
        self.send_tagged(format!("{}:{}|c", name, value), tags)
    }

    fn set_gauge(&self, name: &str, value: GaugeValue) -> Result<()> {
        self.send(format!("{}:{}|g", name, format_gauge(value)))
    }

    fn set_gauge_with_tags(&self, name: &str, tags: &[String], value: GaugeValue) -> Result<()> {
        self.send_tagged(format!("{}:{}|g", name, format_gauge(value)), tags)
    }

    fn set_histogram(&self, name: &str, value: f64) -> Result<()> {
        self.send(format!("{}:{:e}|ms", name, value))
    }

    fn set_histogram_with_tags(&self, name: &str, tags: &[String], value: f64) -> Result<()> {
        self.send_tagged(format!("{}:{:e}|ms", name, value), tags)
    }

    fn set_timing(&self, name: &str, value: f64) -> Result<()> {
        self.set_histogram(name, value)
    }

    fn set_timing_with_tags(&self, name: &str, tags: &[String], value: f64) -> Result<()> {
        self.set_histogram_with_tags(name, tags, value)
    }

    fn add_set_value(&self, name: &str, value: &str) -> Result<()> {
        self.send(format!("{}:{}|s", name, value))
    }

    fn add_set_value_with_tags(&self, name: &str, tags: &[String], value: &str) -> Result<()> {
        self.send_tagged(format!("{}:{}|s", name, value), tags)
    }

    fn set_text(&self, name: &str, value: &str) -> Result<()> {
        self.send(format!("{}:{}|t", name, value))
    }

    fn set_text_with_tags(&self, name: &str, tags: &[String], value: &str) -> Result<()> {
        self.send_tagged(format!("{}:{}|t", name, value), tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Server {
        sock: UdpSocket,
    }

    impl Server {
        fn new() -> Self {
            let sock = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            Server { sock }
        }

        fn port(&self) -> u16 {
            self.sock.local_addr().unwrap().port()
        }

        fn recv(&self) -> String {
            let mut buf = [0u8; 1500];
            let n = self.sock.recv(&mut buf).unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        }
    }

    fn sink(port: u16) -> Statsd {
        Statsd::new(StatsdConfig {
            id: "web01".to_string(),
            port,
            prefix: "host.".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_new_rejects_empty_id() {
        let res = Statsd::new(StatsdConfig {
            id: String::new(),
            port: 8125,
            prefix: "host.".to_string(),
        });
        assert!(res.is_err());
    }

    #[test]
    fn test_new_rejects_zero_port() {
        let res = Statsd::new(StatsdConfig {
            id: "web01".to_string(),
            port: 0,
            prefix: "host.".to_string(),
        });
        assert!(res.is_err());
    }

    #[test]
    fn test_counter_format() {
        let server = Server::new();
        let sink = sink(server.port());

        sink.increment_counter_by("errors", 2).unwrap();
        assert_eq!(server.recv(), "host.web01`errors:2|c");
    }

    #[test]
    fn test_counter_with_tags_format() {
        let server = Server::new();
        let sink = sink(server.port());

        sink.increment_counter_by_with_tags(
            "errors",
            &["log_id:nginx".to_string(), "env:prod".to_string()],
            1,
        )
        .unwrap();
        assert_eq!(server.recv(), "host.web01`errors:1|c|#log_id:nginx,env:prod");
    }

    #[test]
    fn test_malformed_tags_dropped() {
        let server = Server::new();
        let sink = sink(server.port());

        sink.increment_counter_with_tags("errors", &["notatag".to_string()])
            .unwrap();
        // every tag malformed: fall back to the untagged form
        assert_eq!(server.recv(), "host.web01`errors:1|c");
    }

    #[test]
    fn test_histogram_serialized_as_ms_with_float_notation() {
        let server = Server::new();
        let sink = sink(server.port());

        sink.set_histogram("latency", 2.5).unwrap();
        assert_eq!(server.recv(), "host.web01`latency:2.5e0|ms");
    }

    #[test]
    fn test_timing_matches_histogram() {
        let server = Server::new();
        let sink = sink(server.port());

        sink.set_timing("latency", 250.0).unwrap();
        assert_eq!(server.recv(), "host.web01`latency:2.5e2|ms");
    }

    #[test]
    fn test_gauge_formats() {
        let server = Server::new();
        let sink = sink(server.port());

        sink.set_gauge("depth", GaugeValue::Int(42)).unwrap();
        assert_eq!(server.recv(), "host.web01`depth:42|g");

        sink.set_gauge("load", GaugeValue::Float(0.5)).unwrap();
        assert_eq!(server.recv(), "host.web01`load:5e-1|g");
    }

    #[test]
    fn test_set_and_text_formats() {
        let server = Server::new();
        let sink = sink(server.port());

        sink.add_set_value("users", "alice").unwrap();
        assert_eq!(server.recv(), "host.web01`users:alice|s");

        sink.set_text("status", "ready").unwrap();
        assert_eq!(server.recv(), "host.web01`status:ready|t");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = Server::new();
        let sink = sink(server.port());

        sink.start().await.unwrap();
        sink.stop().await.unwrap();
        sink.stop().await.unwrap();

        // lazy reopen still works after stop
        sink.increment_counter("errors").unwrap();
        assert_eq!(server.recv(), "host.web01`errors:1|c");
    }
}
