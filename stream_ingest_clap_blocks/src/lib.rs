//! CLI config for the stream consumer.
use std::{num::NonZeroUsize, time::Duration};

use stream_ingest::{PoolConfig, ReaderGroupConfig};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, Error)]
pub enum Error {
    #[error("a scope must be provided")]
    EmptyScope,

    #[error("at least one stream must be provided")]
    NoStreams,

    #[error("the read timeout must be greater than zero")]
    ZeroReadTimeout,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where to read from and how many readers to run.
#[derive(Debug, Clone, clap::Parser)]
pub struct ConsumerConfig {
    /// Address of the stream controller, e.g. `tcp://localhost:9090`.
    #[clap(long = "controller", env = "STREAM_INGEST_CONTROLLER", action)]
    pub controller: Url,

    /// Scope holding the streams to read.
    #[clap(long = "scope", env = "STREAM_INGEST_SCOPE", action)]
    pub scope: String,

    /// Streams to read. Repeat the flag or separate names with commas.
    #[clap(
        long = "stream",
        env = "STREAM_INGEST_STREAMS",
        value_delimiter = ',',
        required = true,
        action
    )]
    pub streams: Vec<String>,

    /// Reader group the readers join.
    ///
    /// Defaults to `<scope>-<first stream>-reader-group`.
    #[clap(long = "reader-group", env = "STREAM_INGEST_READER_GROUP", action)]
    pub reader_group: Option<String>,

    /// Maximum number of readers, and so of concurrently running leases.
    #[clap(
        long = "max-concurrent-tasks",
        env = "STREAM_INGEST_MAX_CONCURRENT_TASKS",
        default_value = "1",
        action
    )]
    pub max_concurrent_tasks: NonZeroUsize,

    /// The maximum amount of time records may stay uncommitted before offsets should be
    /// committed.
    ///
    /// Committing less often increases throughput, but also widens the window of duplicates
    /// after a rebalance or restart.
    #[clap(
        long = "max-uncommitted-time",
        env = "STREAM_INGEST_MAX_UNCOMMITTED_TIME",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub max_uncommitted_time: Duration,

    /// How long a single read waits for an event before reporting a timeout.
    #[clap(
        long = "read-timeout",
        env = "STREAM_INGEST_READ_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub read_timeout: Duration,
}

impl ConsumerConfig {
    /// The reader group name, explicit or derived from the scope and first stream.
    pub fn reader_group(&self) -> String {
        match &self.reader_group {
            Some(reader_group) => reader_group.clone(),
            None => format!(
                "{}-{}-reader-group",
                self.scope,
                self.streams.first().map(String::as_str).unwrap_or_default()
            ),
        }
    }

    /// Validate the config and build the pool config from it.
    pub fn pool_config(&self) -> Result<PoolConfig> {
        let scope = self.scope.trim();
        if scope.is_empty() {
            return Err(Error::EmptyScope);
        }
        let streams: Vec<String> = self
            .streams
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if streams.is_empty() {
            return Err(Error::NoStreams);
        }
        if self.read_timeout.is_zero() {
            return Err(Error::ZeroReadTimeout);
        }

        let group = ReaderGroupConfig {
            controller: self.controller.clone(),
            scope: scope.to_string(),
            streams,
            reader_group: self.reader_group(),
        };
        Ok(PoolConfig::new(group, self.max_concurrent_tasks)
            .with_max_uncommitted_time(self.max_uncommitted_time)
            .with_read_timeout(self.read_timeout))
    }
}
