//! Quality gate: pre-flight checks, artifact inventory, LLM judge.
//!
//! Decision order short-circuits on the first failed stage:
//! 1. pre-flight schema checks against the task-type config
//! 2. artifact inventory against the declared target files
//! 3. optional LLM judge with structured-output parsing
//!
//! Judge failures never abort a run; they degrade to a fixup verdict.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::models::config::{SwarmConfig, TaskTypeConfig};
use crate::domain::models::task::{SwarmTask, SwarmTaskResult};
use crate::domain::ports::provider::{ChatMessage, ChatOptions, Provider, TokenUsage};

/// Response fragments that mark a completion as boilerplate rather than work.
pub const BOILERPLATE_INDICATORS: &[&str] = &[
    "as an ai",
    "i cannot",
    "i can't directly",
    "here is a plan",
    "here's a plan",
    "you would need to",
    "the next step would be",
];

/// Response fragments promising future work instead of reporting done work.
pub const FUTURE_INTENT_INDICATORS: &[&str] = &[
    "i will now",
    "i'll now",
    "next, i will",
    "going to implement",
    "once that is done",
    "todo:",
    "remains to be implemented",
];

/// Whether the response promises future work instead of reporting results.
pub fn has_future_intent_language(text: &str) -> bool {
    let lower = text.to_lowercase();
    FUTURE_INTENT_INDICATORS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// A hollow completion claims success without producing anything: marker
/// language, no artifacts, on a task that required artifacts.
pub fn is_hollow_completion(task: &SwarmTask, result: &SwarmTaskResult) -> bool {
    if !result.artifacts_changed.is_empty() {
        return false;
    }
    if !TaskTypeConfig::for_type(task.task_type).requires_artifacts {
        return false;
    }
    let lower = result.response.to_lowercase();
    BOILERPLATE_INDICATORS
        .iter()
        .any(|marker| lower.contains(marker))
        || has_future_intent_language(&result.response)
}

/// Extract the first balanced JSON object from free-form model output.
pub fn parse_first_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..=start + offset];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Verdict emitted by the judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeVerdict {
    Approve,
    Fixup,
    Reject,
}

#[derive(Debug, Deserialize)]
struct JudgeResponse {
    score: f64,
    verdict: JudgeVerdict,
    #[serde(default)]
    reasons: Vec<String>,
}

/// Outcome of gating one task result.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub accepted: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    pub requires_fixup: bool,
    pub degraded: bool,
    /// Provider usage of the judge call, charged to the parent reserve.
    pub judge_usage: Option<TokenUsage>,
}

impl GateDecision {
    fn rejected(score: f64, reason: impl Into<String>, fixup: bool) -> Self {
        Self {
            accepted: false,
            score,
            reasons: vec![reason.into()],
            requires_fixup: fixup,
            degraded: false,
            judge_usage: None,
        }
    }
}

/// Applies the three-stage acceptance pipeline to task results.
pub struct QualityGate {
    config: Arc<SwarmConfig>,
    provider: Option<Arc<dyn Provider>>,
    root: PathBuf,
}

impl QualityGate {
    pub fn new(config: Arc<SwarmConfig>, root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            provider: None,
            root: root.into(),
        }
    }

    /// Attach the provider that backs the judge stage.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Evaluate a task result. `retries_remaining` gates whether a failed
    /// evaluation may request a fixup round.
    pub async fn evaluate(
        &self,
        task: &SwarmTask,
        result: &SwarmTaskResult,
        retries_remaining: bool,
    ) -> GateDecision {
        let type_config = TaskTypeConfig::for_type(task.task_type);

        // Stage 1: pre-flight schema checks.
        if !result.success {
            return GateDecision::rejected(0.0, "worker reported failure", retries_remaining);
        }
        if type_config.requires_artifacts && result.artifacts_changed.is_empty() {
            if is_hollow_completion(task, result) {
                return GateDecision::rejected(
                    0.2,
                    "hollow completion: boilerplate response with no artifacts",
                    retries_remaining,
                );
            }
            return GateDecision::rejected(
                0.0,
                "task requires artifacts but none were changed",
                retries_remaining,
            );
        }
        if !task.acceptance_criteria.is_empty() && result.response.trim().is_empty() {
            return GateDecision::rejected(
                0.0,
                "empty response against declared acceptance criteria",
                retries_remaining,
            );
        }

        // Stage 2: artifact inventory over declared target files.
        let mut reasons = Vec::new();
        let mut score = 1.0;
        let mut verdict = JudgeVerdict::Approve;
        let mut judge_usage = None;

        if !task.target_files.is_empty() {
            let declared = task.target_files.len();
            let mut present = 0usize;
            for file in &task.target_files {
                let on_disk = self.file_non_empty(file).await;
                if result.artifacts_changed.iter().any(|a| a == file) && on_disk {
                    present += 1;
                } else {
                    reasons.push(format!("declared target file missing or empty: {file}"));
                }
            }
            if present < declared {
                #[allow(clippy::cast_precision_loss)]
                {
                    score = 0.4 * (present as f64 / declared as f64);
                }
                return self.decide(task, &type_config, score, verdict, reasons, result, retries_remaining, judge_usage);
            }
        }

        // Stage 3: LLM judge.
        if self.config.use_judge {
            if let Some(provider) = &self.provider {
                match self.run_judge(provider.as_ref(), task, result).await {
                    Ok((judge, usage)) => {
                        score = judge.score.clamp(0.0, 1.0);
                        verdict = judge.verdict;
                        reasons.extend(judge.reasons);
                        judge_usage = Some(usage);
                    }
                    Err(reason) => {
                        warn!(task = %task.id, %reason, "judge unavailable; degrading to fixup verdict");
                        score = 0.5;
                        verdict = JudgeVerdict::Fixup;
                        reasons.push("judge parse failed".to_string());
                    }
                }
            }
        }

        self.decide(task, &type_config, score, verdict, reasons, result, retries_remaining, judge_usage)
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        task: &SwarmTask,
        type_config: &TaskTypeConfig,
        score: f64,
        verdict: JudgeVerdict,
        mut reasons: Vec<String>,
        result: &SwarmTaskResult,
        retries_remaining: bool,
        judge_usage: Option<TokenUsage>,
    ) -> GateDecision {
        if verdict != JudgeVerdict::Reject && score >= type_config.acceptance_threshold {
            return GateDecision {
                accepted: true,
                score,
                reasons,
                requires_fixup: false,
                degraded: false,
                judge_usage,
            };
        }

        // Degraded acceptance: sub-threshold but concrete artifacts exist.
        if type_config.degraded_acceptable
            && score >= type_config.degraded_threshold()
            && !result.artifacts_changed.is_empty()
        {
            reasons.push(format!(
                "accepted degraded: score {score:.2} below threshold {:.2}",
                type_config.acceptance_threshold
            ));
            debug!(task = %task.id, score, "degraded acceptance");
            return GateDecision {
                accepted: true,
                score,
                reasons,
                requires_fixup: false,
                degraded: true,
                judge_usage,
            };
        }

        GateDecision {
            accepted: false,
            score,
            reasons,
            requires_fixup: retries_remaining && verdict != JudgeVerdict::Reject,
            degraded: false,
            judge_usage,
        }
    }

    async fn file_non_empty(&self, path: &str) -> bool {
        tokio::fs::metadata(self.root.join(path))
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    async fn run_judge(
        &self,
        provider: &dyn Provider,
        task: &SwarmTask,
        result: &SwarmTaskResult,
    ) -> Result<(JudgeResponse, TokenUsage), String> {
        let prompt = build_judge_prompt(task, result);
        let options = ChatOptions::for_model(self.config.judge_model())
            .with_max_tokens(1_000)
            .with_temperature(0.0)
            .with_system(JUDGE_SYSTEM_PROMPT);

        let response = provider
            .chat(vec![ChatMessage::user(prompt)], options)
            .await
            .map_err(|e| e.to_string())?;

        let value = parse_first_json(&response.content).ok_or("no JSON object in judge output")?;
        let judge: JudgeResponse =
            serde_json::from_value(value).map_err(|e| format!("judge schema mismatch: {e}"))?;
        Ok((judge, response.usage))
    }
}

const JUDGE_SYSTEM_PROMPT: &str = "You are a strict quality judge for automated coding work. \
Reply with a single JSON object: {\"score\": <0..1>, \"verdict\": \"approve\"|\"fixup\"|\"reject\", \
\"reasons\": [<strings>]}. No prose outside the JSON.";

fn build_judge_prompt(task: &SwarmTask, result: &SwarmTaskResult) -> String {
    let mut prompt = format!(
        "Task ({}): {}\n\nWorker response:\n{}\n\nArtifacts changed: {}\n",
        task.task_type.as_str(),
        task.description,
        result.response,
        if result.artifacts_changed.is_empty() {
            "none".to_string()
        } else {
            result.artifacts_changed.join(", ")
        },
    );
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
    }
    prompt.push_str("\nJudge whether the work satisfies the task.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::TaskType;
    use crate::domain::ports::provider::{ChatResponse, ProviderError};
    use async_trait::async_trait;

    struct ScriptedJudge {
        content: String,
    }

    #[async_trait]
    impl Provider for ScriptedJudge {
        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _options: ChatOptions,
        ) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: self.content.clone(),
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    ..TokenUsage::default()
                },
                stop_reason: Some("end_turn".into()),
                tool_calls: vec![],
            })
        }
    }

    fn implement_task() -> SwarmTask {
        SwarmTask::new("t1", "implement the widget", TaskType::Implement)
    }

    fn ok_result(artifacts: Vec<&str>) -> SwarmTaskResult {
        SwarmTaskResult {
            task_id: "t1".into(),
            success: true,
            response: "Implemented the widget and wrote tests.".into(),
            artifacts_changed: artifacts.into_iter().map(String::from).collect(),
            tokens_used: 1_000,
            cost_usd: 0.01,
            duration_ms: 500,
            failure_mode: None,
            accepted_with_degradation: false,
        }
    }

    fn gate(dir: &tempfile::TempDir, use_judge: bool, judge_json: &str) -> QualityGate {
        let config = Arc::new(SwarmConfig {
            use_judge,
            ..SwarmConfig::default()
        });
        let gate = QualityGate::new(config, dir.path());
        if use_judge {
            gate.with_provider(Arc::new(ScriptedJudge {
                content: judge_json.to_string(),
            }))
        } else {
            gate
        }
    }

    #[tokio::test]
    async fn test_missing_artifacts_scores_zero() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, false, "");
        let decision = gate
            .evaluate(&implement_task(), &ok_result(vec![]), true)
            .await;
        assert!(!decision.accepted);
        assert!(decision.score.abs() < f64::EPSILON);
        assert!(decision.requires_fixup);
    }

    #[tokio::test]
    async fn test_hollow_completion_forces_low_score() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, false, "");
        let mut result = ok_result(vec![]);
        result.response = "I will now implement the widget. Here is a plan.".into();
        let decision = gate.evaluate(&implement_task(), &result, true).await;
        assert!(!decision.accepted);
        assert!((decision.score - 0.2).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_inventory_partial_score() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let gate = gate(&dir, false, "");
        let task = implement_task().with_target_files(vec!["a.py".into(), "b.py".into()]);
        let decision = gate
            .evaluate(&task, &ok_result(vec!["a.py"]), false)
            .await;
        assert!(!decision.accepted);
        assert!((decision.score - 0.2).abs() < f64::EPSILON); // 0.4 * 1/2
        assert!(!decision.requires_fixup);
    }

    #[tokio::test]
    async fn test_inventory_requires_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir, false, "");
        let task = implement_task().with_target_files(vec!["ghost.py".into()]);
        // Claimed as changed but never written to disk.
        let decision = gate.evaluate(&task, &ok_result(vec!["ghost.py"]), false).await;
        assert!(!decision.accepted);
        assert!(decision.score.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_accepts_without_judge() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let gate = gate(&dir, false, "");
        let task = implement_task().with_target_files(vec!["a.py".into()]);
        let decision = gate.evaluate(&task, &ok_result(vec!["a.py"]), false).await;
        assert!(decision.accepted);
        assert!(!decision.degraded);
    }

    #[tokio::test]
    async fn test_judge_approval() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let gate = gate(
            &dir,
            true,
            r#"Looks good. {"score": 0.9, "verdict": "approve", "reasons": ["solid work"]}"#,
        );
        let task = implement_task().with_target_files(vec!["a.py".into()]);
        let decision = gate.evaluate(&task, &ok_result(vec!["a.py"]), false).await;
        assert!(decision.accepted);
        assert!((decision.score - 0.9).abs() < f64::EPSILON);
        assert!(decision.judge_usage.is_some());
    }

    #[tokio::test]
    async fn test_judge_parse_failure_degrades_to_fixup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let gate = gate(&dir, true, "I think it's fine, maybe an 8/10?");
        let task = implement_task().with_target_files(vec!["a.py".into()]);
        let decision = gate.evaluate(&task, &ok_result(vec!["a.py"]), true).await;
        assert!(!decision.accepted);
        assert!((decision.score - 0.5).abs() < f64::EPSILON);
        assert!(decision.requires_fixup);
        assert!(decision.reasons.iter().any(|r| r.contains("judge parse failed")));
    }

    #[tokio::test]
    async fn test_degraded_acceptance() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        // Score 0.45 with threshold 0.75: below normal, above the 0.375 floor.
        let gate = gate(
            &dir,
            true,
            r#"{"score": 0.45, "verdict": "fixup", "reasons": ["partial"]}"#,
        );
        let task = implement_task().with_target_files(vec!["a.py".into()]);
        let decision = gate.evaluate(&task, &ok_result(vec!["a.py"]), true).await;
        assert!(decision.accepted);
        assert!(decision.degraded);
    }

    #[tokio::test]
    async fn test_reject_verdict_blocks_fixup() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(
            &dir,
            true,
            r#"{"score": 0.1, "verdict": "reject", "reasons": ["off-task"]}"#,
        );
        // Research tasks need no artifacts, so stages 1-2 pass.
        let task = SwarmTask::new("t1", "investigate", TaskType::Research);
        let decision = gate.evaluate(&task, &ok_result(vec![]), true).await;
        assert!(!decision.accepted);
        assert!(!decision.requires_fixup);
    }

    #[test]
    fn test_parse_first_json_handles_prose_and_nesting() {
        let text = r#"Here you go: {"a": {"b": [1, 2]}, "c": "x{y}"} trailing"#;
        let value = parse_first_json(text).unwrap();
        assert_eq!(value["a"]["b"][1], 2);
        assert_eq!(value["c"], "x{y}");
        assert!(parse_first_json("no json here").is_none());
    }

    #[test]
    fn test_future_intent_detection() {
        assert!(has_future_intent_language("I will now write the code"));
        assert!(!has_future_intent_language("The code is written and tested"));
    }
}
