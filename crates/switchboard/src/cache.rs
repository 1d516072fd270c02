use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::connector::{ConnectError, ProviderConnector};
use crate::provider::ProviderClient;
use crate::registry::ProviderDescriptor;

type Slot = Arc<Mutex<Option<Arc<dyn ProviderClient>>>>;

/// Lazily created provider clients keyed by provider id, kept until their
/// connection dies.
///
/// Each id has its own slot lock, so concurrent first use of one provider
/// establishes a single client while other providers proceed in parallel.
/// A failed establishment leaves the slot empty and the next call retries.
pub struct ProviderClientCache {
    connector: Arc<dyn ProviderConnector>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ProviderClientCache {
    pub fn new(connector: Arc<dyn ProviderConnector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, id: &str) -> Slot {
        self.slots
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Return the cached client for the descriptor's id, establishing it
    /// first if needed. A cached client is returned without a health check.
    pub async fn get_or_create(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<Arc<dyn ProviderClient>, ConnectError> {
        let slot = self.slot(&descriptor.id).await;
        let mut entry = slot.lock().await;
        if let Some(client) = entry.as_ref() {
            return Ok(client.clone());
        }

        tracing::info!(provider = %descriptor.id, "Establishing provider client");
        match self.connector.connect(descriptor).await {
            Ok(client) => {
                *entry = Some(client.clone());
                Ok(client)
            }
            Err(e) => {
                tracing::warn!(provider = %descriptor.id, error = %e, "Provider client establishment failed");
                Err(e)
            }
        }
    }

    /// A cached client, without establishing one.
    pub async fn get(&self, id: &str) -> Option<Arc<dyn ProviderClient>> {
        let slot = self.slots.lock().await.get(id).cloned()?;
        let entry = slot.lock().await;
        entry.clone()
    }

    /// Forget a client whose connection has died so the next use relaunches
    /// it. Nothing happens if the slot already holds a different client.
    pub async fn invalidate(&self, id: &str, client: &Arc<dyn ProviderClient>) -> bool {
        let Some(slot) = self.slots.lock().await.get(id).cloned() else {
            return false;
        };
        let mut entry = slot.lock().await;
        match entry.as_ref() {
            Some(current) if Arc::ptr_eq(current, client) => {
                tracing::info!(provider = id, "Dropping disconnected provider client");
                *entry = None;
                true
            }
            _ => false,
        }
    }

    /// Ids with an established client. Waits behind any establishment in
    /// progress.
    pub async fn cached_ids(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut ids = Vec::new();
        for (id, slot) in slots {
            if slot.lock().await.is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.cached_ids().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
