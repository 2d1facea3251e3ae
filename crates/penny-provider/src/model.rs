//! Provider/model description types shared across the adapter layer.
//!
//! Grounded on `querymt`'s provider registry metadata, trimmed of
//! `querymt`'s models.dev download/cache logic — adapters here are compiled
//! in, so their descriptors are static data, not a fetched catalog.

use serde::{Deserialize, Serialize};

/// Capabilities a model may or may not support, checked by the router
/// before a request is sent to it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub tool_calling: bool,
    pub streaming: bool,
    pub vision: bool,
    pub json_mode: bool,
}

/// Per-million-token pricing, used to compute the cost of a completion
/// for usage accounting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_per_million;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_per_million;
        input_cost + output_cost
    }
}

/// One model a provider exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub capabilities: Capabilities,
    pub pricing: ModelPricing,
}

/// Static description of a provider adapter: its name and the models
/// it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub models: Vec<ModelInfo>,
}

impl ProviderDescriptor {
    pub fn model(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }
}
