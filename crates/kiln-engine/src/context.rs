use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_contracts::events::{EventPayload, EventWriter};
use kiln_contracts::providers::{CapabilityTable, ProviderCatalog};
use kiln_contracts::store::JobStore;
use serde_json::Value;

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::provider::ProviderRegistry;

/// Collaborators shared by the dispatcher and the tracker.
#[derive(Clone)]
pub struct EngineContext {
    pub catalog: Arc<ProviderCatalog>,
    pub providers: Arc<ProviderRegistry>,
    pub store: Arc<dyn JobStore>,
    pub clock: Arc<dyn Clock>,
    pub events: EventWriter,
    pub config: OrchestratorConfig,
}

impl EngineContext {
    pub fn table(&self) -> &CapabilityTable {
        &self.catalog.table
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn record(&self, event_type: &str, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        self.events.record(event_type, payload);
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("providers", &self.providers)
            .field("events", &self.events.path())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
