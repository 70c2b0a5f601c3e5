use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::fallback::FallbackChains;
use crate::content::ContentType;
use crate::error::ParseError;

const DEFAULT_PROVIDERS_JSON: &str = include_str!("../../resources/default_providers.json");

/// Generation backends the orchestrator knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    Dalle3,
    Flux,
    StableDiffusion,
    Runway,
    Luma,
    Kling,
}

impl Engine {
    pub const ALL: [Engine; 6] = [
        Engine::Dalle3,
        Engine::Flux,
        Engine::StableDiffusion,
        Engine::Runway,
        Engine::Luma,
        Engine::Kling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Dalle3 => "dalle3",
            Engine::Flux => "flux",
            Engine::StableDiffusion => "stable-diffusion",
            Engine::Runway => "runway",
            Engine::Luma => "luma",
            Engine::Kling => "kling",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        let engine = match normalized.as_str() {
            "dalle3" | "dall-e-3" | "dalle-3" => Engine::Dalle3,
            "flux" => Engine::Flux,
            "stable-diffusion" | "sdxl" => Engine::StableDiffusion,
            "runway" => Engine::Runway,
            "luma" => Engine::Luma,
            "kling" => Engine::Kling,
            _ => return Err(ParseError::new("engine", raw)),
        };
        Ok(engine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub engine: Engine,
    pub display_name: String,
    pub content_types: Vec<ContentType>,
    pub cost_per_unit: f64,
    pub avg_latency_seconds: f64,
    /// 1 (worst) to 10 (best).
    pub quality_rating: u8,
    pub rate_limit: RateLimit,
}

impl ProviderProfile {
    pub fn supports(&self, content_type: ContentType) -> bool {
        self.content_types.contains(&content_type)
    }
}

/// Static registry of provider capabilities. Iteration follows registration
/// order, which is also the selector's tie-break order.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    profiles: IndexMap<Engine, ProviderProfile>,
    defaults: IndexMap<ContentType, Engine>,
}

impl CapabilityTable {
    pub fn new(profiles: Vec<ProviderProfile>, defaults: IndexMap<ContentType, Engine>) -> Self {
        let mut map = IndexMap::new();
        for profile in profiles {
            map.insert(profile.engine, profile);
        }
        Self {
            profiles: map,
            defaults,
        }
    }

    pub fn get(&self, engine: Engine) -> Option<&ProviderProfile> {
        self.profiles.get(&engine)
    }

    pub fn list(&self) -> impl Iterator<Item = &ProviderProfile> {
        self.profiles.values()
    }

    pub fn by_content_type(&self, content_type: ContentType) -> Vec<&ProviderProfile> {
        self.profiles
            .values()
            .filter(|profile| profile.supports(content_type))
            .collect()
    }

    pub fn ensure(&self, engine: Engine, content_type: ContentType) -> Option<&ProviderProfile> {
        self.get(engine)
            .filter(|profile| profile.supports(content_type))
    }

    pub fn default_for(&self, content_type: ContentType) -> Option<Engine> {
        self.defaults.get(&content_type).copied()
    }
}

/// Capability table plus fallback chains, loaded together from one document.
#[derive(Debug, Clone)]
pub struct ProviderCatalog {
    pub table: CapabilityTable,
    pub fallbacks: FallbackChains,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    providers: Vec<ProviderProfile>,
    #[serde(default)]
    defaults: BTreeMap<String, String>,
    #[serde(default)]
    fallbacks: BTreeMap<String, Vec<String>>,
}

impl ProviderCatalog {
    pub fn builtin() -> Result<Self> {
        Self::load(None)
    }

    /// Loads the embedded catalog and merges `override_path` over it, row by
    /// row and field by field.
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        let mut merged: Value = serde_json::from_str(DEFAULT_PROVIDERS_JSON)
            .context("embedded provider catalog is invalid JSON")?;
        if let Some(path) = override_path {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read provider overrides {}", path.display()))?;
            let overlay: Value = serde_json::from_str(&raw)
                .with_context(|| format!("provider overrides {} are not JSON", path.display()))?;
            merge_catalog(&mut merged, &overlay);
        }
        Self::from_value(merged)
    }

    fn from_value(value: Value) -> Result<Self> {
        let document: CatalogDocument =
            serde_json::from_value(value).context("provider catalog has an invalid shape")?;

        let mut seen = Vec::new();
        for profile in &document.providers {
            if seen.contains(&profile.engine) {
                bail!("provider '{}' is registered twice", profile.engine);
            }
            if !(1..=10).contains(&profile.quality_rating) {
                bail!(
                    "provider '{}' has quality rating {} outside 1-10",
                    profile.engine,
                    profile.quality_rating
                );
            }
            seen.push(profile.engine);
        }

        let mut defaults = IndexMap::new();
        for (content_type, engine) in &document.defaults {
            let content_type: ContentType = content_type.parse()?;
            let engine: Engine = engine.parse()?;
            let supported = document
                .providers
                .iter()
                .any(|profile| profile.engine == engine && profile.supports(content_type));
            if !supported {
                bail!("default engine '{engine}' does not support '{content_type}'");
            }
            defaults.insert(content_type, engine);
        }

        let mut chains = IndexMap::new();
        for (origin, chain) in &document.fallbacks {
            let origin: Engine = origin.parse()?;
            let chain = chain
                .iter()
                .map(|engine| engine.parse::<Engine>())
                .collect::<Result<Vec<_>, _>>()?;
            chains.insert(origin, chain);
        }

        Ok(Self {
            table: CapabilityTable::new(document.providers, defaults),
            fallbacks: FallbackChains::new(chains)?,
        })
    }
}

fn merge_catalog(base: &mut Value, overlay: &Value) {
    let (Some(base), Some(overlay)) = (base.as_object_mut(), overlay.as_object()) else {
        return;
    };
    if let Some(rows) = overlay.get("providers").and_then(Value::as_array) {
        let existing = base
            .entry("providers")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(existing) = existing.as_array_mut() {
            for row in rows {
                merge_provider_row(existing, row);
            }
        }
    }
    for section in ["defaults", "fallbacks"] {
        let Some(entries) = overlay.get(section).and_then(Value::as_object) else {
            continue;
        };
        let target = base
            .entry(section)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(target) = target.as_object_mut() {
            for (key, value) in entries {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_provider_row(rows: &mut Vec<Value>, row: &Value) {
    let Some(overlay) = row.as_object() else {
        return;
    };
    let Some(engine) = overlay.get("engine").and_then(Value::as_str) else {
        return;
    };
    let existing = rows.iter_mut().find_map(|candidate| {
        let object = candidate.as_object_mut()?;
        (object.get("engine").and_then(Value::as_str) == Some(engine)).then_some(object)
    });
    let Some(existing) = existing else {
        rows.push(row.clone());
        return;
    };
    for (field, value) in overlay {
        if let (Some(Value::Object(current)), Value::Object(patch)) =
            (existing.get_mut(field), value)
        {
            for (key, nested) in patch {
                current.insert(key.clone(), nested.clone());
            }
            continue;
        }
        existing.insert(field.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;

    #[test]
    fn builtin_catalog_keeps_registration_order() -> anyhow::Result<()> {
        let catalog = ProviderCatalog::builtin()?;
        let image_engines: Vec<Engine> = catalog
            .table
            .by_content_type(ContentType::Image)
            .into_iter()
            .map(|profile| profile.engine)
            .collect();
        assert_eq!(
            image_engines,
            vec![Engine::Dalle3, Engine::Flux, Engine::StableDiffusion]
        );
        assert_eq!(catalog.table.default_for(ContentType::Video), Some(Engine::Runway));
        assert_eq!(catalog.table.default_for(ContentType::Reel), Some(Engine::Luma));
        Ok(())
    }

    #[test]
    fn ensure_rejects_unsupported_content_type() -> anyhow::Result<()> {
        let catalog = ProviderCatalog::builtin()?;
        assert!(catalog.table.ensure(Engine::Dalle3, ContentType::Image).is_some());
        assert!(catalog.table.ensure(Engine::Dalle3, ContentType::Video).is_none());
        Ok(())
    }

    #[test]
    fn override_file_merges_fields_and_appends_nothing_unknown() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("providers.json");
        fs::write(
            &path,
            serde_json::to_string(&json!({
                "providers": [
                    { "engine": "flux", "cost_per_unit": 0.001, "rate_limit": { "requests_per_day": 7 } }
                ],
                "defaults": { "image": "flux" }
            }))?,
        )?;
        let catalog = ProviderCatalog::load(Some(&path))?;
        let flux = catalog.table.get(Engine::Flux).expect("flux registered");
        assert_eq!(flux.cost_per_unit, 0.001);
        assert_eq!(flux.rate_limit.requests_per_day, 7);
        assert_eq!(flux.rate_limit.requests_per_minute, 60);
        assert_eq!(flux.display_name, "Flux 1.1 Pro (Replicate)");
        assert_eq!(catalog.table.default_for(ContentType::Image), Some(Engine::Flux));
        assert_eq!(catalog.table.list().count(), 6);
        Ok(())
    }

    #[test]
    fn default_must_support_its_content_type() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("providers.json");
        fs::write(&path, r#"{"defaults": {"video": "dalle3"}}"#)?;
        let err = ProviderCatalog::load(Some(&path)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "default engine 'dalle3' does not support 'video'"
        );
        Ok(())
    }

    #[test]
    fn quality_rating_is_bounded() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("providers.json");
        fs::write(&path, r#"{"providers": [{"engine": "luma", "quality_rating": 11}]}"#)?;
        assert!(ProviderCatalog::load(Some(&path)).is_err());
        Ok(())
    }

    #[test]
    fn engine_parse_accepts_aliases() {
        assert_eq!("DALL-E-3".parse::<Engine>(), Ok(Engine::Dalle3));
        assert_eq!("sdxl".parse::<Engine>(), Ok(Engine::StableDiffusion));
        assert!("midjourney".parse::<Engine>().is_err());
        for engine in Engine::ALL {
            assert_eq!(engine.as_str().parse::<Engine>(), Ok(engine));
        }
    }
}
