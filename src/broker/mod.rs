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

//! Broker collaborators.
//!
//! The execution pipeline only knows the [`Publisher`] trait:
//! `publish(topic, bytes, attributes)` returning a broker message id. The
//! shipped implementations are [`PubSubPublisher`] (REST, shared
//! `reqwest::Client`), [`LogPublisher`] (local development without a
//! broker), and [`MemoryPublisher`] (tests). The subscriber side pulls
//! schedule requests from a broker subscription and feeds the registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::PublishError;

pub mod memory;
pub mod pubsub;

pub use memory::MemoryPublisher;
pub use pubsub::{PubSubPublisher, PubSubSubscriber};

/// The egress contract: deliver one message to one topic.
///
/// Implementations are shared across the worker pool and must be
/// thread-safe. At-least-once semantics mean a publish may be repeated for
/// the same task occurrence; idempotence is the consumer's concern.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, PublishError>;
}

/// Publisher for broker-less local runs: logs the delivery and succeeds.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, PublishError> {
        let message_id = Uuid::new_v4().to_string();
        info!(
            topic = %topic,
            bytes = payload.len(),
            attributes = attributes.len(),
            message_id = %message_id,
            "publish (log only)"
        );
        Ok(message_id)
    }
}
