// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::constants;
use crate::error::{Error, ErrorKind};

mod log;

pub use self::log::{Log, LogLevel};

/// Bus main config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "General::default")]
    general: General,

    #[serde(default = "Pool::default")]
    pool: Pool,

    #[serde(default = "Overlay::default")]
    overlay: Overlay,

    #[serde(default = "Log::default")]
    log: Log,
}

impl Config {
    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub const fn pool(&self) -> &Pool {
        &self.pool
    }

    #[must_use]
    pub const fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Read config from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path.as_ref()).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("config: failed to read {:?}, err: {err:?}", path.as_ref()),
            )
        })?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if the string is not valid config TOML.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("config: invalid toml, err: {err}"),
            )
        })
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some options in config is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        self.general.validate()?;
        self.pool.validate()?;
        self.overlay.validate()?;
        self.log.validate()
    }
}

/// General section in config: core table limits.
#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Ceiling of the topic slot table.
    ///
    /// Default is 50.
    #[serde(default = "General::default_max_topics")]
    max_topics: usize,

    /// Topic names must be shorter than this, in bytes.
    ///
    /// Default is 64.
    #[serde(default = "General::default_max_topic_name_length")]
    max_topic_name_length: usize,

    /// Per-topic subscriber ceiling.
    ///
    /// Default is 20.
    #[serde(default = "General::default_max_subscribers_per_topic")]
    max_subscribers_per_topic: usize,

    /// Upper bound of a single message payload, in bytes.
    ///
    /// Default is 1024.
    #[serde(default = "General::default_max_msg_size")]
    max_msg_size: usize,

    /// Default depth of a topic ingress queue.
    ///
    /// Default is 100.
    #[serde(default = "General::default_max_queue_size")]
    max_queue_size: usize,

    /// Delay between a fatal fault and process termination, in
    /// milliseconds.
    ///
    /// Default is 1000ms.
    #[serde(default = "General::default_fatal_grace_ms")]
    fatal_grace_ms: u64,
}

impl General {
    #[must_use]
    pub const fn default_max_topics() -> usize {
        constants::MAX_TOPICS
    }

    #[must_use]
    pub const fn default_max_topic_name_length() -> usize {
        constants::MAX_TOPIC_NAME_LENGTH
    }

    #[must_use]
    pub const fn default_max_subscribers_per_topic() -> usize {
        constants::MAX_SUBSCRIBERS_PER_TOPIC
    }

    #[must_use]
    pub const fn default_max_msg_size() -> usize {
        constants::MAX_MSG_SIZE
    }

    #[must_use]
    pub const fn default_max_queue_size() -> usize {
        constants::MAX_QUEUE_SIZE
    }

    #[must_use]
    pub const fn default_fatal_grace_ms() -> u64 {
        constants::FATAL_GRACE_MS
    }

    #[must_use]
    pub const fn max_topics(&self) -> usize {
        self.max_topics
    }

    #[must_use]
    pub const fn max_topic_name_length(&self) -> usize {
        self.max_topic_name_length
    }

    #[must_use]
    pub const fn max_subscribers_per_topic(&self) -> usize {
        self.max_subscribers_per_topic
    }

    #[must_use]
    pub const fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    #[must_use]
    pub const fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    #[must_use]
    pub const fn fatal_grace(&self) -> Duration {
        Duration::from_millis(self.fatal_grace_ms)
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some limit is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_topics == 0
            || self.max_topic_name_length == 0
            || self.max_subscribers_per_topic == 0
            || self.max_msg_size == 0
            || self.max_queue_size == 0
        {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "config: general limits must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            max_topics: Self::default_max_topics(),
            max_topic_name_length: Self::default_max_topic_name_length(),
            max_subscribers_per_topic: Self::default_max_subscribers_per_topic(),
            max_msg_size: Self::default_max_msg_size(),
            max_queue_size: Self::default_max_queue_size(),
            fatal_grace_ms: Self::default_fatal_grace_ms(),
        }
    }
}

/// Pool section in config: payload pool geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct Pool {
    /// Bytes per pool block.
    ///
    /// Default is 128.
    #[serde(default = "Pool::default_block_size")]
    block_size: usize,

    /// Number of pool blocks.
    ///
    /// Default is 100.
    #[serde(default = "Pool::default_pool_blocks")]
    pool_blocks: usize,
}

impl Pool {
    #[must_use]
    pub const fn default_block_size() -> usize {
        constants::BLOCK_SIZE
    }

    #[must_use]
    pub const fn default_pool_blocks() -> usize {
        constants::POOL_BLOCKS
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub const fn pool_blocks(&self) -> usize {
        self.pool_blocks
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if the pool geometry is zero-sized.
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 || self.pool_blocks == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "config: pool geometry must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            block_size: Self::default_block_size(),
            pool_blocks: Self::default_pool_blocks(),
        }
    }
}

/// Overlay section in config: reliable-delivery retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct Overlay {
    /// Invoke the registered ack callback on retirement.
    ///
    /// Default is true.
    #[serde(default = "Overlay::default_enable_ack")]
    enable_ack: bool,

    /// Re-publish attempts after the initial publish.
    ///
    /// Default is 5.
    #[serde(default = "Overlay::default_retry_count")]
    retry_count: u32,

    /// Interval between retry attempts, in milliseconds.
    ///
    /// Default is 1000ms.
    #[serde(default = "Overlay::default_retry_interval_ms")]
    retry_interval_ms: u64,
}

impl Overlay {
    #[must_use]
    pub const fn default_enable_ack() -> bool {
        true
    }

    #[must_use]
    pub const fn default_retry_count() -> u32 {
        constants::MAX_RETRY_COUNT
    }

    #[must_use]
    pub const fn default_retry_interval_ms() -> u64 {
        constants::RETRY_INTERVAL_MS
    }

    #[must_use]
    pub const fn enable_ack(&self) -> bool {
        self.enable_ack
    }

    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if the retry interval is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.retry_interval_ms == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "config: retry_interval_ms must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for Overlay {
    fn default() -> Self {
        Self {
            enable_ack: Self::default_enable_ack(),
            retry_count: Self::default_retry_count(),
            retry_interval_ms: Self::default_retry_interval_ms(),
        }
    }
}
