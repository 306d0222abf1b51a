// SPDX-License-Identifier: Apache-2.0

//! Logging-only destination: every metric operation is written to the
//! process logger. Always available, no network.

use async_trait::async_trait;
use tracing::info;

use super::{GaugeValue, Result, Sink, valid_tags};

pub struct LogOnly;

impl LogOnly {
    pub fn new() -> Self {
        LogOnly
    }

    fn record(&self, name: &str, value: impl std::fmt::Display) {
        info!(dest = "log", name, value = %value, "metric");
    }

    fn record_tagged(&self, name: &str, tags: &[String], value: impl std::fmt::Display) {
        let tags = valid_tags(tags).join(",");
        info!(dest = "log", name, tags = %tags, value = %value, "metric");
    }
}

impl Default for LogOnly {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for LogOnly {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn increment_counter(&self, name: &str) -> Result<()> {
        self.record(name, 1u64);
        Ok(())
    }

    fn increment_counter_with_tags(&self, name: &str, tags: &[String]) -> Result<()> {
        self.record_tagged(name, tags, 1u64);
        Ok(())
    }

    fn increment_counter_by(&self, name: &str, value: u64) -> Result<()> {
        self.record(name, value);
        Ok(())
    }

    fn increment_counter_by_with_tags(
        &self,
        name: &str,
        tags: &[String],
        value: u64,
    ) -> Result<()> {
        self.record_tagged(name, tags, value);
        Ok(())
    }

    fn set_gauge(&self, name: &str, value: GaugeValue) -> Result<()> {
        self.record(name, value);
        Ok(())
    }

    fn set_gauge_with_tags(&self, name: &str, tags: &[String], value: GaugeValue) -> Result<()> {
        self.record_tagged(name, tags, value);
        Ok(())
    }

    fn set_histogram(&self, name: &str, value: f64) -> Result<()> {
        self.record(name, value);
        Ok(())
    }

    fn set_histogram_with_tags(&self, name: &str, tags: &[String], value: f64) -> Result<()> {
        self.record_tagged(name, tags, value);
        Ok(())
    }

    fn set_timing(&self, name: &str, value: f64) -> Result<()> {
        self.record(name, value);
        Ok(())
    }

    fn set_timing_with_tags(&self, name: &str, tags: &[String], value: f64) -> Result<()> {
        self.record_tagged(name, tags, value);
        Ok(())
    }

    fn add_set_value(&self, name: &str, value: &str) -> Result<()> {
        self.record(name, value);
        Ok(())
    }

    fn add_set_value_with_tags(&self, name: &str, tags: &[String], value: &str) -> Result<()> {
        self.record_tagged(name, tags, value);
        Ok(())
    }

    fn set_text(&self, name: &str, value: &str) -> Result<()> {
        self.record(name, value);
        Ok(())
    }

    fn set_text_with_tags(&self, name: &str, tags: &[String], value: &str) -> Result<()> {
        self.record_tagged(name, tags, value);
        Ok(())
    }
}
