use anyhow::Context;
use aq_core::{
    ApplicationStatus, Classification, ClassifiedApplication, EmailMessage, INDETERMINATE,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::http::{send_with_retry, BackoffPolicy, HttpClientConfig};
use crate::{AdapterError, Classifier};

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const INSTRUCTION: &str = "The email may or may not be a job application email. If it is, \
extract the company, position name, and application status from the email below, plus a \
URL for the company's logo if you know one.
Status must be one of: applied, OA, interview, offer, rejected, indeterminate.
If the email is not about a job application, use \"indeterminate\" for every field.
Return JSON ONLY in the format: {\"company\": \"...\", \"position\": \"...\", \"status\": \"...\", \"logo\": \"...\"}

Email:
";

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
}

impl ClassifierConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_url: ANTHROPIC_API_URL.to_string(),
            api_key: api_key.into(),
            model: "claude-3-7-sonnet-latest".to_string(),
            max_tokens: 300,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set")?;
        let mut config = Self::new(api_key);
        if let Ok(model) = std::env::var("AQ_CLASSIFIER_MODEL") {
            config.model = model;
        }
        if let Some(max_tokens) = std::env::var("AQ_CLASSIFIER_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_tokens = max_tokens;
        }
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
}

/// One Messages API completion per email, deterministic sampling.
#[derive(Debug, Clone)]
pub struct AnthropicClassifier {
    client: reqwest::Client,
    config: ClassifierConfig,
    backoff: BackoffPolicy,
}

impl AnthropicClassifier {
    pub fn new(http: &HttpClientConfig, config: ClassifierConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            config,
            backoff: http.backoff,
        })
    }

    async fn complete(&self, prompt: String) -> Result<String, AdapterError> {
        let request = AnthropicRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: 0.0,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        let resp = send_with_retry(&self.backoff, || {
            self.client
                .post(&self.config.api_url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&request)
        })
        .await?;

        let body: AnthropicResponse = resp.json().await?;
        body.content
            .into_iter()
            .next()
            .map(|block| block.text)
            .ok_or_else(|| AdapterError::Payload("no content in completion".to_string()))
    }
}

#[async_trait]
impl Classifier for AnthropicClassifier {
    async fn classify(&self, email: &EmailMessage) -> Result<Classification, AdapterError> {
        let reply = self
            .complete(format!("{INSTRUCTION}{}", email.prompt_text()))
            .await?;
        let classification = parse_classification(&reply);
        if classification.is_indeterminate() {
            debug!(email_id = %email.id, "email classified as indeterminate");
        }
        Ok(classification)
    }
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    company: Option<String>,
    position: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logo: Option<String>,
}

fn required(value: Option<String>) -> Option<String> {
    let value = value?.trim().to_string();
    if value.is_empty() || value.eq_ignore_ascii_case(INDETERMINATE) {
        None
    } else {
        Some(value)
    }
}

/// Pulls the outermost `{...}` out of a model reply and validates it. Any
/// violation collapses to [`Classification::Indeterminate`].
pub fn parse_classification(reply: &str) -> Classification {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Classification::Indeterminate;
    };
    if end < start {
        return Classification::Indeterminate;
    }

    let raw: RawClassification = match serde_json::from_str(&reply[start..=end]) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "classifier reply is not valid JSON");
            return Classification::Indeterminate;
        }
    };

    let (Some(company), Some(position), Some(status)) = (
        required(raw.company),
        required(raw.position),
        required(raw.status),
    ) else {
        return Classification::Indeterminate;
    };
    let Ok(status) = status.parse::<ApplicationStatus>() else {
        return Classification::Indeterminate;
    };
    // Empty, missing or "null" means no logo; "indeterminate" in any field
    // rejects the whole reply.
    let logo = raw.logo.map(|l| l.trim().to_string());
    if logo.as_deref().is_some_and(|l| l.eq_ignore_ascii_case(INDETERMINATE)) {
        return Classification::Indeterminate;
    }

    Classification::Classified(ClassifiedApplication {
        company,
        position,
        status,
        logo: logo.filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("null")),
    })
}
