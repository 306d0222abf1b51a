// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod configs;
pub mod init;
pub mod metrics;
pub mod telemetry;
pub mod watcher;
