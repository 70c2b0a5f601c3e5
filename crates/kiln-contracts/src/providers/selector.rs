use std::cmp::Ordering;
use std::sync::Arc;

use super::capabilities::{CapabilityTable, Engine, ProviderProfile};
use crate::content::{ContentType, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Override,
    Priority(Priority),
    Default,
    /// No configured default; first compatible engine in registration order.
    FirstCompatible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSelection {
    pub engine: Engine,
    pub requested: Option<Engine>,
    pub reason: SelectionReason,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("engine '{engine}' does not support content type '{content_type}'")]
    Incompatible {
        engine: Engine,
        content_type: ContentType,
    },
    #[error("no engines available for content type '{content_type}'")]
    NoEngine { content_type: ContentType },
}

/// Pure selection over the capability table.
#[derive(Debug, Clone)]
pub struct EngineSelector {
    pub table: Arc<CapabilityTable>,
}

impl EngineSelector {
    pub fn new(table: Arc<CapabilityTable>) -> Self {
        Self { table }
    }

    pub fn select(
        &self,
        content_type: ContentType,
        user_override: Option<Engine>,
        priority: Option<Priority>,
    ) -> Result<EngineSelection, SelectionError> {
        if let Some(requested) = user_override {
            if self.table.ensure(requested, content_type).is_none() {
                return Err(SelectionError::Incompatible {
                    engine: requested,
                    content_type,
                });
            }
            return Ok(EngineSelection {
                engine: requested,
                requested: Some(requested),
                reason: SelectionReason::Override,
            });
        }

        if let Some(priority) = priority {
            let engine = self
                .best_for(content_type, priority)
                .ok_or(SelectionError::NoEngine { content_type })?;
            return Ok(EngineSelection {
                engine,
                requested: None,
                reason: SelectionReason::Priority(priority),
            });
        }

        if let Some(engine) = self
            .table
            .default_for(content_type)
            .filter(|engine| self.table.ensure(*engine, content_type).is_some())
        {
            return Ok(EngineSelection {
                engine,
                requested: None,
                reason: SelectionReason::Default,
            });
        }

        let candidates = self.table.by_content_type(content_type);
        let Some(first) = candidates.first() else {
            return Err(SelectionError::NoEngine { content_type });
        };
        Ok(EngineSelection {
            engine: first.engine,
            requested: None,
            reason: SelectionReason::FirstCompatible,
        })
    }

    /// Best compatible engine for `priority`; ties keep the earlier
    /// registration.
    pub fn best_for(&self, content_type: ContentType, priority: Priority) -> Option<Engine> {
        let mut best: Option<&ProviderProfile> = None;
        for candidate in self.table.by_content_type(content_type) {
            let better = match best {
                None => true,
                Some(current) => rank(candidate, current, priority) == Ordering::Greater,
            };
            if better {
                best = Some(candidate);
            }
        }
        best.map(|profile| profile.engine)
    }
}

fn rank(candidate: &ProviderProfile, current: &ProviderProfile, priority: Priority) -> Ordering {
    match priority {
        Priority::Speed => current
            .avg_latency_seconds
            .partial_cmp(&candidate.avg_latency_seconds)
            .unwrap_or(Ordering::Equal),
        Priority::Quality => candidate.quality_rating.cmp(&current.quality_rating),
        Priority::Cost => current
            .cost_per_unit
            .partial_cmp(&candidate.cost_per_unit)
            .unwrap_or(Ordering::Equal),
    }
}
