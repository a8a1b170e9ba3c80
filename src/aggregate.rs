//! Offline consensus over recorded stage responses.
//!
//! Responses are read from a JSON-lines file (one response object per line)
//! or from a directory of stored run outcomes. They are grouped by question,
//! and for each question the longest successful answer is selected. No model
//! is called.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::pipeline::PipelineOutcome;

pub const CONSENSUS_METHOD: &str = "longest_response";

#[derive(Debug, Default, Deserialize)]
struct ResponseFields {
    #[serde(default)]
    question_id: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default, alias = "stage_name")]
    agent_name: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    content: Option<String>,
}

/// One recorded answer. `raw` is the record as read and is written back as is.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub question_id: Option<String>,
    pub question: Option<String>,
    pub agent_name: String,
    pub success: bool,
    pub content: String,
    pub raw: Value,
}

impl Response {
    pub fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let fields: ResponseFields = serde_json::from_value(raw.clone())?;
        Ok(Self {
            question_id: fields.question_id,
            question: fields.question,
            agent_name: fields.agent_name.unwrap_or_else(|| "unknown".to_string()),
            success: fields.success,
            content: fields.content.unwrap_or_default(),
            raw,
        })
    }

    fn content_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Responses without an id are grouped by their question text.
    fn group_key(&self) -> String {
        match (&self.question_id, &self.question) {
            (Some(id), _) if !id.is_empty() => id.clone(),
            (_, Some(question)) => question.clone(),
            _ => "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LengthStats {
    pub selected_length: usize,
    pub avg_length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub content: String,
    pub selected_agent: String,
    pub consensus_method: &'static str,
    /// Successful responses per agent.
    pub agent_distribution: BTreeMap<String, usize>,
    pub metadata: LengthStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consensus {
    pub success: bool,
    pub total_responses: usize,
    pub successful_responses: usize,
    pub failed_responses: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub selection: Option<Selection>,
}

/// Picks the longest successful response. Ties go to the earliest one.
pub fn consensus(responses: &[Response]) -> Consensus {
    let successful: Vec<&Response> = responses.iter().filter(|r| r.success).collect();
    let total = responses.len();

    let best = successful.iter().copied().reduce(|best, r| {
        if r.content_len() > best.content_len() {
            r
        } else {
            best
        }
    });
    let Some(best) = best else {
        return Consensus {
            success: false,
            total_responses: total,
            successful_responses: 0,
            failed_responses: total,
            error: Some("no successful responses".to_string()),
            selection: None,
        };
    };

    let mut agent_distribution = BTreeMap::new();
    for response in &successful {
        *agent_distribution
            .entry(response.agent_name.clone())
            .or_insert(0) += 1;
    }
    let total_length: usize = successful.iter().map(|r| r.content_len()).sum();

    Consensus {
        success: true,
        total_responses: total,
        successful_responses: successful.len(),
        failed_responses: total - successful.len(),
        error: None,
        selection: Some(Selection {
            content: best.content.clone(),
            selected_agent: best.agent_name.clone(),
            consensus_method: CONSENSUS_METHOD,
            agent_distribution,
            metadata: LengthStats {
                selected_length: best.content_len(),
                avg_length: total_length as f64 / successful.len() as f64,
            },
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionConsensus {
    pub question_id: String,
    pub question: String,
    pub consensus: Consensus,
    pub original_responses: Vec<Value>,
}

/// Groups responses by question, in order of first appearance.
pub fn aggregate_by_question(responses: Vec<Response>) -> Vec<QuestionConsensus> {
    let mut groups: Vec<(String, String, Vec<Response>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for response in responses {
        let key = response.group_key();
        let slot = match index.get(&key) {
            Some(&slot) => slot,
            None => {
                let question = response.question.clone().unwrap_or_default();
                groups.push((key.clone(), question, Vec::new()));
                index.insert(key, groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[slot].2.push(response);
    }

    groups
        .into_iter()
        .map(|(question_id, question, responses)| QuestionConsensus {
            question_id,
            question,
            consensus: consensus(&responses),
            original_responses: responses.into_iter().map(|r| r.raw).collect(),
        })
        .collect()
}

/// Parses JSON lines, skipping blank lines and logging any that do not parse.
pub fn parse_jsonl(contents: &str) -> Vec<Response> {
    let mut responses = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line).and_then(Response::from_value) {
            Ok(response) => responses.push(response),
            Err(e) => warn!(line = index + 1, error = %e, "skipping invalid response"),
        }
    }
    responses
}

/// One response per stage of a stored run.
pub fn responses_from_outcome(question_id: &str, outcome: &PipelineOutcome) -> Vec<Response> {
    outcome
        .stage_results
        .iter()
        .map(|result| Response {
            question_id: Some(question_id.to_string()),
            question: Some(outcome.input.text.clone()),
            agent_name: result.stage_name.clone(),
            success: result.success,
            content: result.content.clone(),
            raw: json!({
                "question_id": question_id,
                "question": outcome.input.text,
                "agent_name": result.stage_name,
                "success": result.success,
                "content": result.content,
                "error": result.error,
            }),
        })
        .collect()
}

/// Reads a JSON-lines file, or every `*.json` run outcome in a directory.
pub async fn load_responses(input: &Path) -> Result<Vec<Response>, RelayError> {
    if !tokio::fs::metadata(input).await?.is_dir() {
        let contents = tokio::fs::read_to_string(input).await?;
        return Ok(parse_jsonl(&contents));
    }

    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(input).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut responses = Vec::new();
    for path in paths {
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<PipelineOutcome>(&contents) {
            Ok(outcome) => {
                let question_id = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                responses.extend(responses_from_outcome(&question_id, &outcome));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable outcome"),
        }
    }
    Ok(responses)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub responses: usize,
    pub questions: usize,
    pub with_consensus: usize,
}

impl AggregateSummary {
    pub fn without_consensus(&self) -> usize {
        self.questions - self.with_consensus
    }
}

/// Aggregates `input` and writes one JSON line per question to `output`.
pub async fn aggregate(input: &Path, output: &Path) -> Result<AggregateSummary, RelayError> {
    let responses = load_responses(input).await?;
    let loaded = responses.len();
    info!(responses = loaded, input = %input.display(), "responses loaded");

    let results = aggregate_by_question(responses);
    let mut lines = String::new();
    for result in &results {
        lines.push_str(&serde_json::to_string(result)?);
        lines.push('\n');
    }
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(output, lines).await?;
    debug!(output = %output.display(), questions = results.len(), "consensus written");

    Ok(AggregateSummary {
        responses: loaded,
        questions: results.len(),
        with_consensus: results.iter().filter(|r| r.consensus.success).count(),
    })
}
