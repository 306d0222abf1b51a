// SPDX-License-Identifier: Apache-2.0

//! Metric destinations and the shared sink interface.
//!
//! Metric types supported:
//!   c  - counter (monotonically increasing value)
//!   g  - gauge (ints or floats)
//!   h  - histogram
//!   ms - timing
//!   s  - set (counts unique values)
//!   t  - text

pub mod intake;
pub mod logonly;
pub mod statsd;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid sink configuration: {0}")]
    Config(String),

    #[error("submission error: {0}")]
    Submit(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A numeric gauge value. Gauge sources are free-form text; parsing tries
/// signed, then unsigned, then floating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GaugeValue {
    Int(i64),
    Uint(u64),
    Float(f64),
}

#[derive(Error, Debug, PartialEq)]
#[error("invalid gauge value {0:?}")]
pub struct ParseGaugeError(String);

impl FromStr for GaugeValue {
    type Err = ParseGaugeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(v) = s.parse::<i64>() {
            return Ok(GaugeValue::Int(v));
        }
        if let Ok(v) = s.parse::<u64>() {
            return Ok(GaugeValue::Uint(v));
        }
        if let Ok(v) = s.parse::<f64>() {
            return Ok(GaugeValue::Float(v));
        }
        Err(ParseGaugeError(s.to_string()))
    }
}

impl fmt::Display for GaugeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GaugeValue::Int(v) => write!(f, "{}", v),
            GaugeValue::Uint(v) => write!(f, "{}", v),
            GaugeValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Keep the well-formed `key:value` members of a tag list. Malformed tags
/// (no `:`, or an empty key) are dropped at the sink boundary.
pub fn valid_tags(tags: &[String]) -> Vec<&str> {
    tags.iter()
        .map(|t| t.as_str())
        .filter(|t| t.split_once(':').is_some_and(|(k, _)| !k.is_empty()))
        .collect()
}

/// A metric destination, shared by every watcher.
///
/// Implementations must be safe to call concurrently. `stop` must be
/// idempotent and flush anything buffered. Errors returned from the metric
/// operations are advisory: callers log them and keep going.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    fn increment_counter(&self, name: &str) -> Result<()>;
    fn increment_counter_with_tags(&self, name: &str, tags: &[String]) -> Result<()>;
    fn increment_counter_by(&self, name: &str, value: u64) -> Result<()>;
    fn increment_counter_by_with_tags(
        &self,
        name: &str,
        tags: &[String],
        value: u64,
    ) -> Result<()>;
    fn set_gauge(&self, name: &str, value: GaugeValue) -> Result<()>;
    fn set_gauge_with_tags(&self, name: &str, tags: &[String], value: GaugeValue) -> Result<()>;
    fn set_histogram(&self, name: &str, value: f64) -> Result<()>;
    fn set_histogram_with_tags(&self, name: &str, tags: &[String], value: f64) -> Result<()>;
    fn set_timing(&self, name: &str, value: f64) -> Result<()>;
    fn set_timing_with_tags(&self, name: &str, tags: &[String], value: f64) -> Result<()>;
    fn add_set_value(&self, name: &str, value: &str) -> Result<()>;
    fn add_set_value_with_tags(&self, name: &str, tags: &[String], value: &str) -> Result<()>;
    fn set_text(&self, name: &str, value: &str) -> Result<()>;
    fn set_text_with_tags(&self, name: &str, tags: &[String], value: &str) -> Result<()>;
}
