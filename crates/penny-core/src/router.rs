//! Picks a provider+model for a request from rules, capabilities, and
//! estimated cost.
//!
//! The priority-ordered rule list with an availability-fallback walk is
//! grounded on `mesoclaw`'s `ai::providers::router::ModelRouter` (task type
//! maps to a priority-ordered target list, falls back down that list when a
//! target is unavailable); cost estimation borrows `querymt-agent`'s
//! `model_heuristics.rs` parameter-default approach (per-model substring
//! matching) and `ModelPricing`'s cost calculation. Generalized from
//! single-session heuristics evaluated once per process into a per-tenant
//! [`RoutingPolicy`] evaluated per request. All of this is pure functions
//! over data — no network I/O, fully unit-testable.

use penny_provider::chat::ChatMessage;
use penny_provider::model::ModelPricing;
use serde::{Deserialize, Serialize};

/// One condition a routing rule may test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum RuleCondition {
    Complexity { op: Operator, value: f32 },
    Capability { op: Operator, value: String },
    Cost { op: Operator, value: f64 },
    Latency { op: Operator, value: f64 },
    Language { op: Operator, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Gt,
    Lt,
    Contains,
    Matches,
}

/// One rule in a tenant's routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub priority: i32,
    pub condition: RuleCondition,
    pub model: String,
}

/// A tenant's routing policy, falling back to a system default if absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub rules: Vec<RoutingRule>,
}

impl RoutingPolicy {
    pub fn system_default(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            fallback_models: Vec::new(),
            rules: Vec::new(),
        }
    }
}

/// Facts extracted from a request, used to evaluate routing rules and to
/// estimate cost.
#[derive(Debug, Clone, Copy)]
pub struct RequestFacts {
    pub complexity: f32,
    pub has_tools: bool,
    pub has_vision: bool,
    pub message_count: usize,
    pub estimated_input_tokens: u32,
}

impl RequestFacts {
    /// Complexity heuristic: normalized sum of
    /// `(aggregate message length / 10000) + 0.3*has_tools + 0.2*(len>10)`,
    /// clamped to `[0, 1]`.
    pub fn from_messages(messages: &[ChatMessage], has_tools: bool) -> Self {
        let total_len: usize = messages.iter().map(|m| m.text().len()).sum();
        let mut complexity = total_len as f32 / 10_000.0;
        if has_tools {
            complexity += 0.3;
        }
        if messages.len() > 10 {
            complexity += 0.2;
        }
        let complexity = complexity.clamp(0.0, 1.0);

        Self {
            complexity,
            has_tools,
            has_vision: messages.iter().any(|m| m.has_image()),
            message_count: messages.len(),
            estimated_input_tokens: estimate_tokens(messages),
        }
    }
}

/// Crude token estimate (4 characters per token), used only for the cost
/// estimate in routing decisions, not for billing — billed usage comes from
/// the provider's reported [`penny_provider::chat::Usage`].
fn estimate_tokens(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages.iter().map(|m| m.text().len()).sum();
    ((chars as f32) / 4.0).ceil() as u32
}

/// Unicode-block language heuristic.
pub fn detect_language(text: &str) -> &'static str {
    for ch in text.chars() {
        let cp = ch as u32;
        if (0x4E00..=0x9FFF).contains(&cp) {
            return "zh";
        }
        if (0x3040..=0x309F).contains(&cp) || (0x30A0..=0x30FF).contains(&cp) {
            return "ja";
        }
        if (0x0600..=0x06FF).contains(&cp) {
            return "ar";
        }
    }
    "en"
}

fn condition_matches(condition: &RuleCondition, facts: &RequestFacts, text: &str) -> bool {
    match condition {
        RuleCondition::Complexity { op, value } => compare_f32(facts.complexity, *op, *value),
        RuleCondition::Capability { op, value } => {
            let has = match value.as_str() {
                "vision" => facts.has_vision,
                "function_calling" | "tools" => facts.has_tools,
                _ => false,
            };
            matches!(op, Operator::Eq) && has
        }
        RuleCondition::Cost { op, value } => {
            compare_f64(facts.estimated_input_tokens as f64 / 1000.0, *op, *value)
        }
        RuleCondition::Latency { .. } => false, // no latency signal available pre-request
        RuleCondition::Language { op, value } => {
            let lang = detect_language(text);
            match op {
                Operator::Eq => lang == value,
                Operator::Contains => value.contains(lang),
                _ => false,
            }
        }
    }
}

fn compare_f32(actual: f32, op: Operator, value: f32) -> bool {
    match op {
        Operator::Eq => (actual - value).abs() < f32::EPSILON,
        Operator::Gt => actual > value,
        Operator::Lt => actual < value,
        _ => false,
    }
}

fn compare_f64(actual: f64, op: Operator, value: f64) -> bool {
    match op {
        Operator::Eq => (actual - value).abs() < f64::EPSILON,
        Operator::Gt => actual > value,
        Operator::Lt => actual < value,
        _ => false,
    }
}

/// Which adapter a model is currently reachable through, used to resolve a
/// chosen model name to the provider that actually serves it.
pub trait ModelCatalog {
    /// Returns the adapter name that can currently serve `model`, if any.
    fn resolve(&self, model: &str) -> Option<String>;
}

/// The outcome of a routing decision: the model to use and which adapter
/// serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub adapter: String,
    pub model: String,
}

/// Evaluates `policy` against `request_model`/`facts`/`text`, resolving
/// through `catalog` with fallback. Returns `None` when no provider can
/// serve the request — callers treat this as `NO_PROVIDER`.
pub fn route(
    policy: &RoutingPolicy,
    request_model: Option<&str>,
    facts: &RequestFacts,
    text: &str,
    catalog: &dyn ModelCatalog,
) -> Option<RoutingDecision> {
    let mut candidates: Vec<&str> = Vec::new();

    // Tie-break: lower priority number wins; ties broken by stable
    // declaration order, so sort defensively rather than rely on the
    // caller's rule ordering.
    let mut rules: Vec<&RoutingRule> = policy.rules.iter().collect();
    rules.sort_by_key(|r| r.priority);
    if let Some(rule) = rules
        .iter()
        .find(|r| condition_matches(&r.condition, facts, text))
    {
        candidates.push(&rule.model);
    } else if let Some(model) = request_model {
        candidates.push(model);
    } else {
        candidates.push(&policy.default_model);
    }

    for fallback in &policy.fallback_models {
        candidates.push(fallback);
    }

    for model in candidates {
        if let Some(adapter) = catalog.resolve(model) {
            return Some(RoutingDecision {
                adapter,
                model: model.to_string(),
            });
        }
    }
    None
}

/// Cost estimate in USD for a request, given its estimated token count and
/// a model's per-million pricing, reusing
/// [`ModelPricing::calculate_cost`] from the provider adapter's model
/// descriptors.
pub fn estimate_cost(facts: &RequestFacts, pricing: &ModelPricing, estimated_output_tokens: u32) -> f64 {
    pricing.calculate_cost(facts.estimated_input_tokens, estimated_output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeCatalog(HashMap<&'static str, &'static str>);

    impl ModelCatalog for FakeCatalog {
        fn resolve(&self, model: &str) -> Option<String> {
            self.0.get(model).map(|s| s.to_string())
        }
    }

    #[test]
    fn falls_back_to_default_model_when_no_rule_matches() {
        let policy = RoutingPolicy::system_default("gpt-4o");
        let facts = RequestFacts {
            complexity: 0.1,
            has_tools: false,
            has_vision: false,
            message_count: 1,
            estimated_input_tokens: 10,
        };
        let catalog = FakeCatalog(HashMap::from([("gpt-4o", "openai")]));
        let decision = route(&policy, None, &facts, "hi", &catalog).unwrap();
        assert_eq!(decision.model, "gpt-4o");
        assert_eq!(decision.adapter, "openai");
    }

    #[test]
    fn lower_priority_rule_wins_on_tie() {
        let mut policy = RoutingPolicy::system_default("gpt-4o");
        policy.rules = vec![
            RoutingRule {
                priority: 10,
                condition: RuleCondition::Complexity {
                    op: Operator::Gt,
                    value: 0.0,
                },
                model: "low-priority-model".into(),
            },
            RoutingRule {
                priority: 1,
                condition: RuleCondition::Complexity {
                    op: Operator::Gt,
                    value: 0.0,
                },
                model: "high-priority-model".into(),
            },
        ];
        let facts = RequestFacts {
            complexity: 0.5,
            has_tools: false,
            has_vision: false,
            message_count: 1,
            estimated_input_tokens: 10,
        };
        let catalog = FakeCatalog(HashMap::from([
            ("low-priority-model", "a"),
            ("high-priority-model", "b"),
        ]));
        let decision = route(&policy, None, &facts, "hi", &catalog).unwrap();
        assert_eq!(decision.model, "high-priority-model");
    }

    #[test]
    fn falls_through_to_fallback_models_when_chosen_unreachable() {
        let mut policy = RoutingPolicy::system_default("unreachable-model");
        policy.fallback_models = vec!["backup-model".into()];
        let facts = RequestFacts {
            complexity: 0.0,
            has_tools: false,
            has_vision: false,
            message_count: 1,
            estimated_input_tokens: 10,
        };
        let catalog = FakeCatalog(HashMap::from([("backup-model", "openai")]));
        let decision = route(&policy, None, &facts, "hi", &catalog).unwrap();
        assert_eq!(decision.model, "backup-model");
    }

    #[test]
    fn returns_none_when_no_provider_can_serve() {
        let policy = RoutingPolicy::system_default("gpt-4o");
        let facts = RequestFacts {
            complexity: 0.0,
            has_tools: false,
            has_vision: false,
            message_count: 1,
            estimated_input_tokens: 10,
        };
        let catalog = FakeCatalog(HashMap::new());
        assert!(route(&policy, None, &facts, "hi", &catalog).is_none());
    }

    #[test]
    fn complexity_heuristic_saturates_on_long_message_with_tools() {
        let long_text = "a".repeat(10_000);
        let messages = vec![ChatMessage::user(long_text)];
        let facts = RequestFacts::from_messages(&messages, true);
        assert!((facts.complexity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn detects_han_script() {
        assert_eq!(detect_language("你好"), "zh");
    }

    #[test]
    fn detects_arabic_script() {
        assert_eq!(detect_language("مرحبا"), "ar");
    }

    #[test]
    fn defaults_to_english() {
        assert_eq!(detect_language("hello"), "en");
    }
}
