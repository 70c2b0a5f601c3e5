use indexmap::IndexMap;

use super::capabilities::{CapabilityTable, Engine};
use crate::content::ContentType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackError {
    #[error("fallback chain for '{0}' cycles back to itself")]
    CyclesToOrigin(Engine),
    #[error("fallback chain for '{origin}' lists '{engine}' more than once")]
    Duplicate { origin: Engine, engine: Engine },
}

/// Statically configured retry order per engine.
#[derive(Debug, Clone, Default)]
pub struct FallbackChains {
    chains: IndexMap<Engine, Vec<Engine>>,
}

impl FallbackChains {
    pub fn new(chains: IndexMap<Engine, Vec<Engine>>) -> Result<Self, FallbackError> {
        for (origin, chain) in &chains {
            let mut seen = Vec::with_capacity(chain.len());
            for engine in chain {
                if engine == origin {
                    return Err(FallbackError::CyclesToOrigin(*origin));
                }
                if seen.contains(engine) {
                    return Err(FallbackError::Duplicate {
                        origin: *origin,
                        engine: *engine,
                    });
                }
                seen.push(*engine);
            }
        }
        Ok(Self { chains })
    }

    pub fn chain(&self, engine: Engine) -> &[Engine] {
        self.chains
            .get(&engine)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Ordered alternates for `engine`, minus anything already attempted and
    /// anything that cannot produce `content_type`. Empty means give up.
    pub fn fallbacks_for(
        &self,
        engine: Engine,
        content_type: ContentType,
        table: &CapabilityTable,
        attempted: &[Engine],
    ) -> Vec<Engine> {
        self.chain(engine)
            .iter()
            .copied()
            .filter(|candidate| *candidate != engine)
            .filter(|candidate| !attempted.contains(candidate))
            .filter(|candidate| table.ensure(*candidate, content_type).is_some())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderCatalog;

    #[test]
    fn chain_excludes_attempted_engines() -> anyhow::Result<()> {
        let catalog = ProviderCatalog::builtin()?;
        let fallbacks = catalog.fallbacks.fallbacks_for(
            Engine::Dalle3,
            ContentType::Image,
            &catalog.table,
            &[Engine::Flux],
        );
        assert_eq!(fallbacks, vec![Engine::StableDiffusion]);
        Ok(())
    }

    #[test]
    fn chain_is_content_type_aware() -> anyhow::Result<()> {
        let catalog = ProviderCatalog::builtin()?;
        let mut chains = IndexMap::new();
        chains.insert(Engine::Runway, vec![Engine::Dalle3, Engine::Luma]);
        let fallbacks = FallbackChains::new(chains)?.fallbacks_for(
            Engine::Runway,
            ContentType::Video,
            &catalog.table,
            &[],
        );
        assert_eq!(fallbacks, vec![Engine::Luma]);
        Ok(())
    }

    #[test]
    fn exhausted_chain_is_empty() -> anyhow::Result<()> {
        let catalog = ProviderCatalog::builtin()?;
        let fallbacks = catalog.fallbacks.fallbacks_for(
            Engine::Luma,
            ContentType::Reel,
            &catalog.table,
            &[Engine::Runway, Engine::Kling],
        );
        assert!(fallbacks.is_empty());
        assert!(catalog
            .fallbacks
            .fallbacks_for(Engine::Luma, ContentType::Image, &catalog.table, &[])
            .is_empty());
        Ok(())
    }

    #[test]
    fn rejects_chain_that_returns_to_origin() {
        let mut chains = IndexMap::new();
        chains.insert(Engine::Flux, vec![Engine::Dalle3, Engine::Flux]);
        assert_eq!(
            FallbackChains::new(chains).unwrap_err(),
            FallbackError::CyclesToOrigin(Engine::Flux)
        );
    }

    #[test]
    fn rejects_duplicate_entries() {
        let mut chains = IndexMap::new();
        chains.insert(Engine::Flux, vec![Engine::Dalle3, Engine::Dalle3]);
        assert!(matches!(
            FallbackChains::new(chains),
            Err(FallbackError::Duplicate { .. })
        ));
    }
}
