/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Configuration for the scheduler runner and the service around it.
//!
//! [`SchedulerConfig`] carries the tuning knobs of the polling loop, worker
//! pool, leases, and failure backoff. Use the builder for custom values:
//!
//! ```rust,ignore
//! let config = SchedulerConfig::builder()
//!     .max_threads(16)
//!     .polling_interval(Duration::from_secs(5))
//!     .build();
//! ```
//!
//! [`ServiceConfig::from_env`] assembles the full service configuration from
//! the environment: `DATABASE_URL`, `PUBSUB_PROJECT_ID`,
//! `PUBSUB_SUBSCRIPTION`, `PUBSUB_CREDENTIALS_PATH`, `MAX_THREADS`,
//! `POLLING_INTERVAL_SECONDS`, `API_PORT`, `API_USERNAME`, `API_PASSWORD`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for the scheduler runner.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SchedulerConfig {
    polling_interval: Duration,
    max_threads: usize,
    batch_size: Option<usize>,
    lease_timeout: Duration,
    lease_heartbeat_interval: Option<Duration>,
    backoff_base: Duration,
    backoff_ceiling: Duration,
    publish_timeout: Duration,
    shutdown_grace: Duration,
    db_pool_size: Option<u32>,
}

impl SchedulerConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Cadence at which the polling loop scans for due tasks.
    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Size of the worker pool.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Maximum rows claimed per tick. Defaults to `max_threads * 3`.
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(self.max_threads * 3)
    }

    /// How long a lease may go without a heartbeat before another worker
    /// may reclaim the row.
    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Cadence of lease heartbeats. Defaults to a quarter of the lease
    /// timeout.
    pub fn lease_heartbeat_interval(&self) -> Duration {
        self.lease_heartbeat_interval
            .unwrap_or(self.lease_timeout / 4)
    }

    /// First step of the exponential failure backoff.
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    /// Upper bound of the failure backoff.
    pub fn backoff_ceiling(&self) -> Duration {
        self.backoff_ceiling
    }

    /// Timeout applied to each broker publish attempt.
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// How long shutdown waits for in-flight pipelines before giving up.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Connection pool size. Defaults to `max_threads + 2` so workers, the
    /// polling loop, and heartbeats never starve each other.
    pub fn db_pool_size(&self) -> u32 {
        self.db_pool_size.unwrap_or(self.max_threads as u32 + 2)
    }

    /// Backoff delay before a task's next attempt after `failures`
    /// consecutive failures: `min(base * 2^(failures - 1), ceiling)`.
    pub fn failure_backoff(&self, failures: i32) -> Duration {
        let exponent = failures.max(1) as u32 - 1;
        match 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.backoff_base.checked_mul(factor))
        {
            Some(delay) if delay < self.backoff_ceiling => delay,
            _ => self.backoff_ceiling,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfigBuilder::default().build()
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self {
            config: SchedulerConfig {
                polling_interval: Duration::from_secs(10),
                max_threads: 10,
                batch_size: None,
                lease_timeout: Duration::from_secs(240),
                lease_heartbeat_interval: None,
                backoff_base: Duration::from_secs(30),
                backoff_ceiling: Duration::from_secs(3600),
                publish_timeout: Duration::from_secs(30),
                shutdown_grace: Duration::from_secs(30),
                db_pool_size: None,
            },
        }
    }
}

impl SchedulerConfigBuilder {
    /// Sets the polling interval.
    pub fn polling_interval(mut self, value: Duration) -> Self {
        self.config.polling_interval = value;
        self
    }

    /// Sets the worker pool size.
    pub fn max_threads(mut self, value: usize) -> Self {
        self.config.max_threads = value;
        self
    }

    /// Sets the claim batch size.
    pub fn batch_size(mut self, value: usize) -> Self {
        self.config.batch_size = Some(value);
        self
    }

    /// Sets the lease timeout.
    pub fn lease_timeout(mut self, value: Duration) -> Self {
        self.config.lease_timeout = value;
        self
    }

    /// Sets the lease heartbeat interval.
    pub fn lease_heartbeat_interval(mut self, value: Duration) -> Self {
        self.config.lease_heartbeat_interval = Some(value);
        self
    }

    /// Sets the failure backoff base.
    pub fn backoff_base(mut self, value: Duration) -> Self {
        self.config.backoff_base = value;
        self
    }

    /// Sets the failure backoff ceiling.
    pub fn backoff_ceiling(mut self, value: Duration) -> Self {
        self.config.backoff_ceiling = value;
        self
    }

    /// Sets the publish timeout.
    pub fn publish_timeout(mut self, value: Duration) -> Self {
        self.config.publish_timeout = value;
        self
    }

    /// Sets the shutdown grace period.
    pub fn shutdown_grace(mut self, value: Duration) -> Self {
        self.config.shutdown_grace = value;
        self
    }

    /// Sets the database pool size.
    pub fn db_pool_size(mut self, value: u32) -> Self {
        self.config.db_pool_size = Some(value);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Project owning topics addressed by simple name.
    pub project_id: Option<String>,
    /// Subscription the ingress adapter pulls schedule requests from.
    pub subscription: Option<String>,
    /// File holding a bearer token for the broker's REST surface.
    pub credentials_path: Option<PathBuf>,
    /// Override for the broker endpoint (emulators, proxies).
    pub endpoint: Option<String>,
}

/// HTTP API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            username: None,
            password: None,
        }
    }
}

/// Everything the `start` command needs, read from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    pub broker: BrokerConfig,
    pub api: ApiConfig,
}

impl ServiceConfig {
    /// Reads the service configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;

        let mut builder = SchedulerConfig::builder();
        if let Some(max_threads) = parse_var::<usize>("MAX_THREADS")? {
            builder = builder.max_threads(max_threads);
        }
        if let Some(seconds) = parse_var::<u64>("POLLING_INTERVAL_SECONDS")? {
            builder = builder.polling_interval(Duration::from_secs(seconds));
        }

        let broker = BrokerConfig {
            project_id: std::env::var("PUBSUB_PROJECT_ID").ok(),
            subscription: std::env::var("PUBSUB_SUBSCRIPTION").ok(),
            credentials_path: std::env::var("PUBSUB_CREDENTIALS_PATH").ok().map(PathBuf::from),
            endpoint: std::env::var("PUBSUB_EMULATOR_HOST")
                .ok()
                .map(|host| format!("http://{}", host)),
        };

        let api = ApiConfig {
            port: parse_var::<u16>("API_PORT")?.unwrap_or(8080),
            username: std::env::var("API_USERNAME").ok(),
            password: std::env::var("API_PASSWORD").ok(),
        };

        Ok(ServiceConfig {
            database_url,
            scheduler: builder.build(),
            broker,
            api,
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                var,
                value,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
