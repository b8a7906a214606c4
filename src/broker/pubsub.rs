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

//! Pub/Sub REST collaborators: the publish client used by the execution
//! pipeline and the pull subscriber that feeds schedule requests into the
//! registry.
//!
//! Authentication is a static bearer token read from
//! `PUBSUB_CREDENTIALS_PATH`; minting and refreshing that token is the
//! deployment's concern. Against an emulator (`PUBSUB_EMULATOR_HOST`) no
//! token is needed.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Publisher;
use crate::config::BrokerConfig;
use crate::error::{PublishError, SchedulerError, SubmitError};
use crate::registry::TaskRegistry;
use crate::request::ScheduleRequest;
use crate::runner::Counters;

const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";
const PULL_BATCH: usize = 10;
const IDLE_PULL_DELAY: Duration = Duration::from_secs(1);

/// Publishes through the Pub/Sub REST surface.
pub struct PubSubPublisher {
    client: reqwest::Client,
    endpoint: String,
    project_id: String,
    token: Option<String>,
}

impl PubSubPublisher {
    /// Builds a publisher from broker configuration.
    ///
    /// Requires a project id so simple topic names can be qualified. The
    /// endpoint defaults to the public API unless an emulator override is
    /// configured.
    pub fn new(config: &BrokerConfig, timeout: Duration) -> Result<Self, SchedulerError> {
        let project_id = config.project_id.clone().ok_or_else(|| {
            SchedulerError::Configuration("PUBSUB_PROJECT_ID is required for publishing".into())
        })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            project_id,
            token: config_token(config)?,
        })
    }

    fn qualified_topic(&self, topic: &str) -> String {
        if topic.starts_with("projects/") {
            topic.to_string()
        } else {
            format!("projects/{}/topics/{}", self.project_id, topic)
        }
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.post(url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[async_trait]
impl Publisher for PubSubPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, PublishError> {
        let url = format!("{}/v1/{}:publish", self.endpoint, self.qualified_topic(topic));

        let mut message = json!({ "data": BASE64.encode(payload) });
        if !attributes.is_empty() {
            message["attributes"] = json!(attributes);
        }

        let response = self
            .request(url)
            .json(&json!({ "messages": [message] }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Timeout
                } else {
                    PublishError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Malformed(e.to_string()))?;

        parsed
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| PublishError::Malformed("response carried no message id".to_string()))
    }
}

/// Pulls schedule requests from a broker subscription into the registry.
///
/// Acks successful submits and permanent parse failures (replaying those
/// forever would only storm the subscription); nacks transient scheduling
/// failures so the broker redelivers.
pub struct PubSubSubscriber {
    client: reqwest::Client,
    endpoint: String,
    subscription: String,
    token: Option<String>,
    registry: TaskRegistry,
    counters: std::sync::Arc<Counters>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PulledMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PulledMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
}

impl PubSubSubscriber {
    /// Builds a subscriber from broker configuration; returns `None` when no
    /// subscription is configured.
    pub fn new(
        config: &BrokerConfig,
        registry: TaskRegistry,
        counters: std::sync::Arc<Counters>,
    ) -> Result<Option<Self>, SchedulerError> {
        let Some(subscription) = config.subscription.clone() else {
            return Ok(None);
        };

        let subscription = if subscription.starts_with("projects/") {
            subscription
        } else {
            let project = config.project_id.clone().ok_or_else(|| {
                SchedulerError::Configuration(
                    "PUBSUB_PROJECT_ID is required for a simple subscription name".into(),
                )
            })?;
            format!("projects/{}/subscriptions/{}", project, subscription)
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(45))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        Ok(Some(Self {
            client,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            subscription,
            token: config_token(config)?,
            registry,
            counters,
        }))
    }

    /// Pull loop; runs until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(subscription = %self.subscription, "broker ingress started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.pull_once() => {
                    match result {
                        Ok(0) => tokio::time::sleep(IDLE_PULL_DELAY).await,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("pull failed: {}", e);
                            tokio::time::sleep(IDLE_PULL_DELAY).await;
                        }
                    }
                }
            }
        }
        info!("broker ingress stopped");
    }

    async fn pull_once(&self) -> Result<usize, PublishError> {
        let url = format!("{}/v1/{}:pull", self.endpoint, self.subscription);
        let response = self
            .post(url)
            .json(&json!({ "maxMessages": PULL_BATCH }))
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let pulled: PullResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Malformed(e.to_string()))?;

        let count = pulled.received_messages.len();
        let mut acks = Vec::new();
        let mut nacks = Vec::new();

        for received in pulled.received_messages {
            self.counters.record_received();
            match self.handle(&received.message).await {
                Disposition::Ack => acks.push(received.ack_id),
                Disposition::Nack => nacks.push(received.ack_id),
            }
        }

        if !acks.is_empty() {
            self.acknowledge(acks).await?;
        }
        if !nacks.is_empty() {
            self.release(nacks).await?;
        }

        Ok(count)
    }

    async fn handle(&self, message: &PulledMessage) -> Disposition {
        let bytes = match BASE64.decode(message.data.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(message_id = %message.message_id, "undecodable ingress message: {}", e);
                return Disposition::Ack;
            }
        };

        let request: ScheduleRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => {
                error!(message_id = %message.message_id, "unparseable schedule request: {}", e);
                return Disposition::Ack;
            }
        };

        match self.registry.submit(request).await {
            Ok(receipt) => {
                debug!(task_instance = %receipt.task_instance, "ingress message scheduled");
                Disposition::Ack
            }
            Err(SubmitError::Duplicate { task_instance }) => {
                debug!(task_instance = %task_instance, "duplicate ingress message");
                Disposition::Ack
            }
            Err(SubmitError::Validation(e)) => {
                error!(message_id = %message.message_id, "invalid schedule request: {}", e);
                Disposition::Ack
            }
            Err(SubmitError::Encode(e)) => {
                error!(message_id = %message.message_id, "unencodable schedule request: {}", e);
                Disposition::Ack
            }
            Err(SubmitError::Store(e)) => {
                warn!(message_id = %message.message_id, "transient scheduling failure: {}", e);
                Disposition::Nack
            }
        }
    }

    async fn acknowledge(&self, ack_ids: Vec<String>) -> Result<(), PublishError> {
        let url = format!("{}/v1/{}:acknowledge", self.endpoint, self.subscription);
        self.post(url)
            .json(&json!({ "ackIds": ack_ids }))
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Nack by zeroing the ack deadline so the broker redelivers promptly.
    async fn release(&self, ack_ids: Vec<String>) -> Result<(), PublishError> {
        let url = format!(
            "{}/v1/{}:modifyAckDeadline",
            self.endpoint, self.subscription
        );
        self.post(url)
            .json(&json!({ "ackIds": ack_ids, "ackDeadlineSeconds": 0 }))
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(())
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.post(url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

enum Disposition {
    Ack,
    Nack,
}

fn config_token(config: &BrokerConfig) -> Result<Option<String>, SchedulerError> {
    match &config.credentials_path {
        None => Ok(None),
        Some(path) => std::fs::read_to_string(path)
            .map(|token| Some(token.trim().to_string()))
            .map_err(|e| {
                SchedulerError::Configuration(format!(
                    "failed to read credentials from {}: {}",
                    path.display(),
                    e
                ))
            }),
    }
}
