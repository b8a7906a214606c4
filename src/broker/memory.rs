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

//! In-memory publisher used by the integration tests: records every
//! delivery and can inject a number of failures to exercise the backoff
//! path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::Publisher;
use crate::error::PublishError;

/// One recorded delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
}

/// A [`Publisher`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    failures_remaining: AtomicUsize,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publish calls fail with a transport error.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Snapshot of everything published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, PublishError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures_remaining
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(PublishError::Transport("injected failure".to_string()));
        }

        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                attributes: attributes.clone(),
            });

        Ok(Uuid::new_v4().to_string())
    }
}
