//! Prompt templates (§4.G.1-3 "render the ... prompt template"). Every
//! template here has a fixed shape with a handful of substitutions, so
//! plain string formatting is used rather than a templating engine.

use quorum_state::{Blueprint, TaskState};
use std::collections::HashMap;

pub fn render_analyze_prompt(user_prompt: &str) -> String {
    format!(
        "You are analyzing a coding request for a software project.\n\n\
         Request:\n{user_prompt}\n\n\
         Produce a structured analysis covering: claims (what the request \
         actually asks for), risks (what could go wrong), and \
         recommendations (how to approach it). Be concrete and specific."
    )
}

pub fn render_refine_prompt(own_analysis: &str, others: &[(&str, &str)]) -> String {
    let mut others_block = String::new();
    for (agent, text) in others {
        others_block.push_str(&format!("\n--- {agent} ---\n{text}\n"));
    }
    format!(
        "Here is your previous analysis:\n{own_analysis}\n\n\
         Here are analyses from other agents:\n{others_block}\n\n\
         Refine your analysis, incorporating any claims, risks, or \
         recommendations you missed. Keep disagreements explicit rather \
         than papering over them."
    )
}

pub fn render_moderator_prompt(analyses: &HashMap<String, String>) -> String {
    let mut block = String::new();
    for (agent, text) in analyses {
        block.push_str(&format!("\n--- {agent} ---\n{text}\n"));
    }
    format!(
        "Score the following analyses for mutual agreement across three \
         categories: claims, risks, recommendations. For each category \
         return a similarity score in [0,1], where 1.0 means full \
         agreement. Respond with JSON only: {{\"per_category\": \
         {{\"claims\": <number>, \"risks\": <number>, \"recommendations\": \
         <number>}}}}.\nAnalyses:{block}"
    )
}

pub fn render_synthesize_prompt(analyses: &HashMap<String, String>) -> String {
    let mut block = String::new();
    for (agent, text) in analyses {
        block.push_str(&format!("\n--- {agent} ---\n{text}\n"));
    }
    format!(
        "Synthesize the following analyses into one consolidated analysis \
         covering claims, risks, and recommendations. Resolve \
         disagreements by favoring the most specific, actionable \
         statement.\nAnalyses:{block}"
    )
}

pub fn render_plan_prompt(analysis: &str, blueprint: &Blueprint) -> String {
    let agents: Vec<&str> = blueprint.analyze_agents.iter().map(String::as_str).collect();
    format!(
        "Given the following analysis, produce a task list for \
         implementation. Respond with JSON only: {{\"tasks\": [{{\"id\": \
         string, \"name\": string, \"description\": string, \"agent\": \
         string, \"model\": string or null, \"dependencies\": [string]}}]}}. \
         Valid agent names: {agents:?}.\n\nAnalysis:\n{analysis}"
    )
}

pub fn render_execute_prompt(task: &TaskState, analysis_excerpt: &str) -> String {
    format!(
        "Task: {}\nDescription: {}\n\nRelevant analysis:\n{}\n\n\
         Implement this task in the current worktree.",
        task.name, task.description, analysis_excerpt
    )
}

/// §4.G.1 "Feedback prepending": user feedback goes verbatim before the
/// consolidated analysis text, separated by a marker line.
pub fn prepend_feedback(analysis: &str, feedback: &str) -> String {
    format!("User feedback:\n{feedback}\n---\n{analysis}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_feedback_puts_feedback_first() {
        let merged = prepend_feedback("original analysis", "please add tests");
        assert!(merged.starts_with("User feedback:\nplease add tests"));
        assert!(merged.ends_with("original analysis"));
    }

    #[test]
    fn plan_prompt_lists_valid_agents() {
        let mut blueprint = Blueprint::default();
        blueprint.analyze_agents = vec!["claude".to_string(), "gemini".to_string()];
        let prompt = render_plan_prompt("some analysis", &blueprint);
        assert!(prompt.contains("claude"));
        assert!(prompt.contains("gemini"));
    }
}
