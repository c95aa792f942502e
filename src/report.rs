//! Risk report generation through an external text-generation service.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregate::ClassSummary;
use crate::config::ReportSettings;
use crate::error::PipelineError;

/// Class name whose presence raises the reported risk.
pub const ELEVATED_RISK_CLASS: &str = "spalling";

pub const SYSTEM_INSTRUCTION: &str = "\
You are a licensed building condition inspector. You assess the state of a \
structure from the results of a YOLO defect-detection model and recommend \
what should be done.
The model detects two classes: crack and spalling. A crack is a fracture in \
the surface or body of the structure; spalling is concrete flaking or \
breaking away from the surface.
The input is a list of per-class results, for example:
[{\"class_name\": \"crack\", \"count\": 3, \"avg_confidence\": 0.8542}, \
{\"class_name\": \"spalling\", \"count\": 1, \"avg_confidence\": 0.9215}]
If any spalling is detected, rate the structure as high risk.
Answer in exactly this format:
Risk level: [risk %]
Reasoning: [reasoning]
Recommended actions: [actions]";

/// One request to the text-generation collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct NarrativeRequest {
    pub model: String,
    pub system: String,
    /// Serialized class summary, sent verbatim as the user message.
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Text-generation capability.
pub trait NarrativeGenerator: Send + Sync {
    fn complete(&self, api_key: &str, request: &NarrativeRequest) -> Result<String>;
}

/// Where the API key comes from.
#[derive(Clone, Debug)]
pub enum Credential {
    /// Read from this environment variable at call time.
    Env(String),
    /// Supplied by the embedding application.
    Provided(String),
}

impl Credential {
    fn resolve(&self) -> Result<String, PipelineError> {
        match self {
            Credential::Env(var) => std::env::var(var)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| PipelineError::MissingCredential(var.clone())),
            Credential::Provided(value) if !value.trim().is_empty() => Ok(value.clone()),
            Credential::Provided(_) => Err(PipelineError::MissingCredential(
                "provided API key".to_string(),
            )),
        }
    }
}

pub struct ReportGenerator {
    client: Arc<dyn NarrativeGenerator>,
    credential: Credential,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ReportGenerator {
    pub fn new(client: Arc<dyn NarrativeGenerator>, settings: &ReportSettings) -> Self {
        Self {
            client,
            credential: Credential::Env(settings.api_key_env.clone()),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn build_request(&self, summary: &[ClassSummary]) -> Result<NarrativeRequest, PipelineError> {
        let user = serde_json::to_string(summary).map_err(PipelineError::service)?;
        Ok(NarrativeRequest {
            model: self.model.clone(),
            system: SYSTEM_INSTRUCTION.to_string(),
            user,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        })
    }

    /// Ask the collaborator for a narrative. The text is returned verbatim.
    pub fn generate(&self, summary: &[ClassSummary]) -> Result<String, PipelineError> {
        let api_key = self.credential.resolve()?;
        let request = self.build_request(summary)?;
        log::info!(
            "requesting risk narrative for {} class(es) from model {}",
            summary.len(),
            request.model
        );
        self.client
            .complete(&api_key, &request)
            .map_err(PipelineError::service)
    }
}

/// Narrative plus the evidence that goes with it.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub subject: String,
    pub narrative: String,
    pub attachments: Vec<PathBuf>,
}

impl Report {
    pub fn compose(
        subject_prefix: &str,
        summary: &[ClassSummary],
        narrative: String,
        attachments: Vec<PathBuf>,
    ) -> Self {
        let counts = if summary.is_empty() {
            "no defects".to_string()
        } else {
            summary
                .iter()
                .map(|entry| format!("{} {}", entry.count, entry.class_name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let risk = if has_elevated_risk(summary) {
            " [HIGH RISK]"
        } else {
            ""
        };
        let subject = format!(
            "{}{} structural defect report: {}",
            subject_prefix.trim_end(),
            risk,
            counts
        )
        .trim_start()
        .to_string();
        Self {
            subject,
            narrative,
            attachments,
        }
    }
}

pub fn has_elevated_risk(summary: &[ClassSummary]) -> bool {
    summary
        .iter()
        .any(|entry| entry.class_name.eq_ignore_ascii_case(ELEVATED_RISK_CLASS))
}

// ----------------------------------------------------------------------------
// OpenAI-compatible chat completions adapter
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Blocking client for a `/v1/chat/completions` endpoint.
pub struct ChatCompletionsClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl ChatCompletionsClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            endpoint: endpoint.into(),
            agent,
        }
    }

    pub fn from_settings(settings: &ReportSettings) -> Self {
        Self::new(settings.endpoint.clone(), settings.timeout)
    }
}

impl NarrativeGenerator for ChatCompletionsClient {
    fn complete(&self, api_key: &str, request: &NarrativeRequest) -> Result<String> {
        let body = ChatRequest {
            model: &request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = match self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", api_key))
            .send_json(&body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(anyhow!(
                    "chat completions returned HTTP {}: {}",
                    code,
                    detail.trim()
                ));
            }
            Err(err) => return Err(anyhow::Error::new(err).context("chat completions request")),
        };

        let parsed: ChatResponse = response
            .into_json()
            .context("invalid chat completions response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat completions response had no content"))
    }
}
