mod capabilities;
mod fallback;
mod selector;

pub use capabilities::{CapabilityTable, Engine, ProviderCatalog, ProviderProfile, RateLimit};
pub use fallback::{FallbackChains, FallbackError};
pub use selector::{EngineSelection, EngineSelector, SelectionError, SelectionReason};
