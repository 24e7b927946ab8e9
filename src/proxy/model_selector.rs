// Model selector - resolves the client-facing alias to a concrete Gemini model

use crate::config::ModelsConfig;

/// Reasoning-effort tiers accepted by the alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffortTier {
    Fast,
    Balanced,
    Best,
}

impl EffortTier {
    /// Absent or unrecognized hints fall back to the balanced tier.
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint.map(|h| h.trim().to_ascii_lowercase()).as_deref() {
            Some("low") => EffortTier::Fast,
            Some("high") => EffortTier::Best,
            _ => EffortTier::Balanced,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    alias: String,
    fast: String,
    balanced: String,
    best: String,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::from_config(&ModelsConfig::default())
    }
}

impl ModelSelector {
    pub fn from_config(config: &ModelsConfig) -> Self {
        Self {
            alias: config.alias.clone(),
            fast: config.fast.clone(),
            balanced: config.balanced.clone(),
            best: config.best.clone(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn is_alias(&self, model: &str) -> bool {
        model == self.alias
    }

    pub fn tier_model(&self, tier: EffortTier) -> &str {
        match tier {
            EffortTier::Fast => &self.fast,
            EffortTier::Balanced => &self.balanced,
            EffortTier::Best => &self.best,
        }
    }

    /// Concrete upstream model for `requested`. The effort hint only
    /// matters for the alias and is never part of the upstream body.
    pub fn select(&self, requested: &str, effort: Option<&str>) -> String {
        if !self.is_alias(requested) {
            if let Some(effort) = effort {
                tracing::debug!("Ignoring effort hint {:?} for non-alias model {}", effort, requested);
            }
            return requested.to_string();
        }

        let tier = EffortTier::from_hint(effort);
        let model = self.tier_model(tier).to_string();
        tracing::debug!("Alias {} resolved to {} ({:?})", requested, model, tier);
        model
    }

    /// Concrete models the alias can resolve to, deduplicated, fast tier first.
    pub fn tier_models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = Vec::new();
        for tier in [EffortTier::Fast, EffortTier::Balanced, EffortTier::Best] {
            let model = self.tier_model(tier);
            if !models.contains(&model) {
                models.push(model);
            }
        }
        models
    }
}
