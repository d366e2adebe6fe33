//! Wave critic: reviews each completed wave and proposes fixup tasks.
//!
//! Runs only when enabled in config. Critic failures never block the run;
//! they degrade to a `good` assessment.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::models::config::SwarmConfig;
use crate::domain::models::task::{SwarmTask, SwarmTaskResult};
use crate::domain::ports::provider::{ChatMessage, ChatOptions, Provider, TokenUsage};
use crate::services::quality_gate::parse_first_json;

/// Overall verdict for a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaveAssessment {
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "needs-fixes")]
    NeedsFixes,
    #[serde(rename = "critical-issues")]
    CriticalIssues,
}

impl WaveAssessment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::NeedsFixes => "needs-fixes",
            Self::CriticalIssues => "critical-issues",
        }
    }
}

/// Per-task feedback row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssessment {
    pub task_id: String,
    pub assessment: String,
    #[serde(default)]
    pub feedback: String,
}

/// One fixup the critic wants applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixupInstruction {
    pub fixes_task_id: String,
    pub fix_description: String,
    #[serde(default)]
    pub target_files: Vec<String>,
}

/// Result of reviewing one wave.
#[derive(Debug, Clone)]
pub struct WaveReviewResult {
    pub assessment: WaveAssessment,
    pub task_assessments: Vec<TaskAssessment>,
    pub fixup_instructions: Vec<FixupInstruction>,
    pub usage: Option<TokenUsage>,
}

impl WaveReviewResult {
    fn good() -> Self {
        Self {
            assessment: WaveAssessment::Good,
            task_assessments: Vec::new(),
            fixup_instructions: Vec::new(),
            usage: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CriticResponse {
    assessment: WaveAssessment,
    #[serde(default)]
    task_assessments: Vec<TaskAssessment>,
    #[serde(default)]
    fixups: Vec<FixupInstruction>,
}

const CRITIC_SYSTEM_PROMPT: &str = "You review the output of a wave of automated coding tasks. \
Reply with a single JSON object: {\"assessment\": \"good\"|\"needs-fixes\"|\"critical-issues\", \
\"task_assessments\": [{\"task_id\", \"assessment\", \"feedback\"}], \
\"fixups\": [{\"fixes_task_id\", \"fix_description\", \"target_files\"}]}. No prose outside the JSON.";

/// Review a completed wave. `completed` pairs each accepted task with its
/// result; `failed` lists the wave's terminal failures.
pub async fn review_wave(
    provider: &dyn Provider,
    config: &SwarmConfig,
    wave_index: usize,
    completed: &[(&SwarmTask, &SwarmTaskResult)],
    failed: &[&SwarmTask],
) -> WaveReviewResult {
    if completed.is_empty() {
        return WaveReviewResult {
            assessment: WaveAssessment::CriticalIssues,
            task_assessments: failed
                .iter()
                .map(|t| TaskAssessment {
                    task_id: t.id.clone(),
                    assessment: "failed".to_string(),
                    feedback: "Task did not complete".to_string(),
                })
                .collect(),
            fixup_instructions: Vec::new(),
            usage: None,
        };
    }

    let prompt = build_review_prompt(wave_index, completed, failed);
    let options = ChatOptions::for_model(&config.orchestrator_model)
        .with_max_tokens(2_000)
        .with_temperature(0.2)
        .with_system(CRITIC_SYSTEM_PROMPT);

    let response = match provider.chat(vec![ChatMessage::user(prompt)], options).await {
        Ok(response) => response,
        Err(e) => {
            warn!(wave = wave_index, error = %e, "critic wave review failed");
            return WaveReviewResult::good();
        }
    };

    let Some(value) = parse_first_json(&response.content) else {
        warn!(wave = wave_index, "critic returned no JSON; treating wave as good");
        return WaveReviewResult::good();
    };
    match serde_json::from_value::<CriticResponse>(value) {
        Ok(parsed) => WaveReviewResult {
            assessment: parsed.assessment,
            task_assessments: parsed.task_assessments,
            fixup_instructions: parsed.fixups,
            usage: Some(response.usage),
        },
        Err(e) => {
            warn!(wave = wave_index, error = %e, "critic response schema mismatch");
            WaveReviewResult::good()
        }
    }
}

/// Convert critic fixup instructions into queue-ready fixup tasks.
/// A `good` assessment produces none.
pub fn build_fixup_tasks(review: &WaveReviewResult, wave_index: usize) -> Vec<SwarmTask> {
    if review.assessment == WaveAssessment::Good {
        return Vec::new();
    }
    review
        .fixup_instructions
        .iter()
        .enumerate()
        .filter(|(_, instr)| !instr.fixes_task_id.is_empty() && !instr.fix_description.is_empty())
        .map(|(i, instr)| {
            SwarmTask::fixup(
                format!("fixup-w{wave_index}-{i}"),
                instr.fixes_task_id.clone(),
                instr.fix_description.clone(),
                instr.target_files.clone(),
            )
        })
        .collect()
}

fn build_review_prompt(
    wave_index: usize,
    completed: &[(&SwarmTask, &SwarmTaskResult)],
    failed: &[&SwarmTask],
) -> String {
    let mut prompt = format!("Wave {} finished. Completed tasks:\n", wave_index);
    for (task, result) in completed {
        prompt.push_str(&format!(
            "- {} ({}): {}\n  artifacts: {}\n  response excerpt: {}\n",
            task.id,
            task.task_type.as_str(),
            task.description,
            if result.artifacts_changed.is_empty() {
                "none".to_string()
            } else {
                result.artifacts_changed.join(", ")
            },
            excerpt(&result.response, 400),
        ));
    }
    if !failed.is_empty() {
        prompt.push_str("\nFailed tasks:\n");
        for task in failed {
            prompt.push_str(&format!("- {}: {}\n", task.id, task.description));
        }
    }
    prompt.push_str("\nAssess the wave and list any fixups needed.");
    prompt
}

fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
