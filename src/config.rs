use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::error::IpmiError;

/// Configuration for a [`crate::manager::ConnectionManager`] and the
/// connections it creates.
///
/// Values can be built up programmatically or parsed from property maps via
/// [`IpmiConfig::from_properties`]; absent keys fall back to the defaults
/// below.
#[derive(Debug, Clone)]
pub struct IpmiConfig {
    /// Frequency of the no-op commands that keep an established session from
    /// expiring on the BMC side.
    pub ping_period: Duration,

    /// Upper bound on concurrently running timer tasks.
    pub timer_thread_pool_size: usize,

    /// Time to wait for a response to a single send attempt.
    pub request_timeout: Duration,

    /// Number of re-sends after the initial attempt.
    pub retries: u32,

    /// Maximum number of in-flight post-handshake commands per connection.
    /// Must stay below 64 so the 6-bit wire correlator cannot collide.
    pub pipeline_limit: usize,
}

impl Default for IpmiConfig {
    fn default() -> IpmiConfig {
        IpmiConfig {
            ping_period: Duration::from_millis(20_000),
            timer_thread_pool_size: 5,
            request_timeout: Duration::from_millis(2_000),
            retries: 3,
            pipeline_limit: 16,
        }
    }
}

impl IpmiConfig {
    /// Builds a configuration from up to two property sources. Later sources
    /// win for keys present in both. Recognised keys: `pingPeriod` (ms),
    /// `timerThreadPoolSize`, `requestTimeout` (ms), `retries`.
    pub fn from_properties(sources: &[&FxHashMap<String, String>]) -> Result<IpmiConfig, IpmiError> {
        let mut config = IpmiConfig::default();

        if let Some(raw) = Self::lookup(sources, "pingPeriod") {
            config.ping_period = Duration::from_millis(Self::parse_u64("pingPeriod", raw)?);
        }
        if let Some(raw) = Self::lookup(sources, "timerThreadPoolSize") {
            config.timer_thread_pool_size = Self::parse_u64("timerThreadPoolSize", raw)? as usize;
        }
        if let Some(raw) = Self::lookup(sources, "requestTimeout") {
            config.request_timeout = Duration::from_millis(Self::parse_u64("requestTimeout", raw)?);
        }
        if let Some(raw) = Self::lookup(sources, "retries") {
            config.retries = Self::parse_u64("retries", raw)? as u32;
        }

        Ok(config)
    }

    fn lookup<'a>(sources: &[&'a FxHashMap<String, String>], key: &str) -> Option<&'a str> {
        sources
            .iter()
            .rev()
            .find_map(|source| source.get(key).map(String::as_str))
    }

    fn parse_u64(key: &str, raw: &str) -> Result<u64, IpmiError> {
        raw.trim()
            .parse()
            .map_err(|_| IpmiError::ConfigurationMissing(format!("{}={}", key, raw)))
    }
}
