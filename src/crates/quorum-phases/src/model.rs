//! Phase-local working data (§4.G). These types carry intermediate results
//! between Analyzer/Planner/Executor steps; they're transient, not part of
//! the durable `quorum-state` model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parsed `consolidated_analysis` checkpoint payload (§4.G.1 Output).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidatedAnalysis {
    pub content: String,
    pub sources: Vec<String>,
}

/// One round's per-agent analysis text, keyed by agent name.
pub type AgentAnalyses = HashMap<String, String>;

/// Moderator agent's scored verdict for one round (§4.G.1 "scored pairwise
/// by the moderator agent against a rubric").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorVerdict {
    pub per_category: HashMap<String, f64>,
}

impl ModeratorVerdict {
    /// Weighted mean of per-category scores. §9 treats the canonical scoring
    /// formula as opaque and "safe to reimplement with any documented
    /// metric"; this is that metric.
    pub fn weighted_score(&self, weights: &HashMap<String, f64>) -> f64 {
        if self.per_category.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        let mut total_weight = 0.0;
        for (category, score) in &self.per_category {
            let weight = weights.get(category).copied().unwrap_or(1.0);
            total += score * weight;
            total_weight += weight;
        }
        if total_weight == 0.0 {
            0.0
        } else {
            total / total_weight
        }
    }
}

/// One task as emitted in the planning agent's structured response, before
/// validation and DAG insertion (§4.G.2 Algorithm).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlanResponse {
    pub tasks: Vec<PlannedTask>,
}

/// Collaborator's reply at a `phase_awaiting_review` gate (§4.G.4
/// Interactive mode: "continue | rerun | feedback:<text> | abort").
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDecision {
    Continue,
    Rerun,
    Feedback(String),
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_score_applies_configured_weights() {
        let mut per_category = HashMap::new();
        per_category.insert("claims".to_string(), 1.0);
        per_category.insert("risks".to_string(), 0.0);
        let verdict = ModeratorVerdict { per_category };

        let mut weights = HashMap::new();
        weights.insert("claims".to_string(), 3.0);
        weights.insert("risks".to_string(), 1.0);

        assert!((verdict.weighted_score(&weights) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn weighted_score_defaults_to_equal_weight() {
        let mut per_category = HashMap::new();
        per_category.insert("claims".to_string(), 0.4);
        per_category.insert("risks".to_string(), 0.6);
        let verdict = ModeratorVerdict { per_category };

        assert!((verdict.weighted_score(&HashMap::new()) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_verdict_scores_zero() {
        let verdict = ModeratorVerdict { per_category: HashMap::new() };
        assert_eq!(verdict.weighted_score(&HashMap::new()), 0.0);
    }
}
