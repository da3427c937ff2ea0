//! Delivery transports and the per-channel registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use herald_common::error::AppError;
use herald_common::types::Channel;

/// Delivers one message to one recipient over a single transport.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), AppError>;
}

/// Channel → sender map, fixed once built.
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn builder() -> SenderRegistryBuilder {
        SenderRegistryBuilder::default()
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn Sender>> {
        self.senders.get(&channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.senders.contains_key(c))
            .collect()
    }
}

#[derive(Default)]
pub struct SenderRegistryBuilder {
    senders: HashMap<Channel, Arc<dyn Sender>>,
}

impl SenderRegistryBuilder {
    /// Register `sender` for `channel`, replacing any earlier registration.
    pub fn register(mut self, channel: Channel, sender: Arc<dyn Sender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn build(self) -> SenderRegistry {
        SenderRegistry {
            senders: self.senders,
        }
    }
}
