//! Generation backends behind one interface.
//!
//! [`TextGenerator`] is the capability the pipeline needs: one prompt in,
//! raw text out. [`GenerationClient`] is the closed set of adapters chosen
//! from a [`ProviderSelection`] when a job starts:
//!
//! | Variant | Backend | Auth |
//! |---|---|---|
//! | `AzureOpenAi` | deployment chat completions | `api-key` header |
//! | `Gemini` | `models/{model}:generateContent` | `key` query parameter |
//! | `Factory` | any provider known to `edgequake-llm` | provider env vars |
//!
//! Each adapter shapes its own request and translates its own failures into
//! [`GenerateError`]: HTTP 429/5xx and transport errors are retryable,
//! content-filter signals are [`GenerateError::ContentFiltered`], and a
//! length cut-off returns the partial text with `truncated = true`.

use crate::config::{Credentials, GenerationOptions, PipelineConfig, ProviderKind, ProviderSelection};
use crate::error::GenerateError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, LLMResponse, ProviderFactory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Raw reply of one generation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    /// The backend stopped at the output limit; `text` is partial.
    pub truncated: bool,
    pub input_tokens: Option<usize>,
    pub output_tokens: Option<usize>,
}

/// One prompt in, raw text out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, GenerateError>;

    /// Provider label for logs.
    fn label(&self) -> String;
}

/// The adapters, selected once per job.
pub enum GenerationClient {
    AzureOpenAi(AzureOpenAiAdapter),
    Gemini(GeminiAdapter),
    Factory(FactoryAdapter),
}

impl std::fmt::Debug for GenerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GenerationClient({})", self.label())
    }
}

impl GenerationClient {
    /// Build the adapter for `selection`, failing fast on missing credentials
    /// or a model the provider does not offer.
    pub fn from_selection(
        selection: &ProviderSelection,
        credentials: &Credentials,
        config: &PipelineConfig,
    ) -> Result<Self, GenerateError> {
        if selection.validate().is_err() {
            return Err(GenerateError::UnsupportedModel {
                provider: selection.provider.name().to_string(),
                model: selection.model.clone(),
            });
        }

        let output_cap = config.model_profile(&selection.model).max_output_tokens;
        let timeout = Duration::from_secs(config.api_timeout_secs);

        let client = match &selection.provider {
            ProviderKind::AzureOpenAi => GenerationClient::AzureOpenAi(AzureOpenAiAdapter::new(
                credentials,
                &selection.model,
                output_cap,
                timeout,
            )?),
            ProviderKind::Gemini => GenerationClient::Gemini(GeminiAdapter::new(
                credentials,
                &selection.model,
                output_cap,
                timeout,
            )?),
            ProviderKind::Factory(name) => {
                GenerationClient::Factory(FactoryAdapter::new(name, &selection.model)?)
            }
        };
        debug!("Generation client ready: {}", client.label());
        Ok(client)
    }

    /// Wrap a provider the caller already built.
    pub fn from_provider(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        GenerationClient::Factory(FactoryAdapter {
            provider,
            label: label.into(),
        })
    }
}

#[async_trait]
impl TextGenerator for GenerationClient {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, GenerateError> {
        match self {
            GenerationClient::AzureOpenAi(a) => a.generate(prompt, options).await,
            GenerationClient::Gemini(a) => a.generate(prompt, options).await,
            GenerationClient::Factory(a) => a.generate(prompt, options).await,
        }
    }

    fn label(&self) -> String {
        match self {
            GenerationClient::AzureOpenAi(a) => format!("azure-openai/{}", a.deployment),
            GenerationClient::Gemini(a) => format!("gemini/{}", a.model),
            GenerationClient::Factory(a) => a.label.clone(),
        }
    }
}

// ── Azure OpenAI ─────────────────────────────────────────────────────────

const AZURE_API_VERSION: &str = "2024-02-01";

/// Azure OpenAI deployment chat completions.
pub struct AzureOpenAiAdapter {
    client: reqwest::Client,
    endpoint: String,
    deployment: String,
    key: String,
    output_cap: usize,
    timeout: Duration,
}

impl AzureOpenAiAdapter {
    /// Key and endpoint are required. The deployment defaults to the model
    /// name when `AZURE_OPENAI_DEPLOYMENT` is unset.
    pub fn new(
        credentials: &Credentials,
        model: &str,
        output_cap: usize,
        timeout: Duration,
    ) -> Result<Self, GenerateError> {
        let (Some(key), Some(endpoint)) = (
            credentials.azure_openai_api_key.as_ref(),
            credentials.azure_openai_endpoint.as_ref(),
        ) else {
            return Err(GenerateError::CredentialsMissing {
                provider: "azure-openai".into(),
                hint: "Set AZURE_OPENAI_API_KEY and AZURE_OPENAI_ENDPOINT.".into(),
            });
        };
        Ok(Self {
            client: http_client(timeout, "azure-openai")?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            deployment: credentials
                .azure_openai_deployment
                .clone()
                .unwrap_or_else(|| model.to_string()),
            key: key.clone(),
            output_cap,
            timeout,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, AZURE_API_VERSION
        )
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, GenerateError> {
        let request = AzureRequest {
            messages: vec![AzureMessage {
                role: "user",
                content: prompt,
            }],
            temperature: options.temperature,
            max_tokens: options.max_output_tokens.min(self.output_cap),
            top_p: options.top_p,
            stop: (!options.stop_sequences.is_empty()).then_some(options.stop_sequences.as_slice()),
        };

        let response = self
            .client
            .post(self.url())
            .header("api-key", &self.key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("azure-openai", e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("azure-openai", e, self.timeout))?;
        if !status.is_success() {
            return Err(status_error("azure-openai", status.as_u16(), &body));
        }

        let parsed: AzureResponse =
            serde_json::from_str(&body).map_err(|e| GenerateError::MalformedResponse {
                provider: "azure-openai".into(),
                detail: e.to_string(),
            })?;
        interpret_azure(parsed)
    }
}

#[derive(Serialize)]
struct AzureRequest<'a> {
    messages: Vec<AzureMessage<'a>>,
    temperature: f32,
    max_tokens: usize,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Serialize)]
struct AzureMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AzureResponse {
    #[serde(default)]
    choices: Vec<AzureChoice>,
    usage: Option<AzureUsage>,
}

#[derive(Deserialize)]
struct AzureChoice {
    message: Option<AzureReply>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct AzureReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct AzureUsage {
    prompt_tokens: Option<usize>,
    completion_tokens: Option<usize>,
}

fn interpret_azure(response: AzureResponse) -> Result<Generation, GenerateError> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(GenerateError::MalformedResponse {
            provider: "azure-openai".into(),
            detail: "no choices in response".into(),
        });
    };
    let text = choice.message.and_then(|m| m.content).unwrap_or_default();
    let truncated = match choice.finish_reason.as_deref() {
        Some("content_filter") if text.is_empty() => {
            return Err(GenerateError::ContentFiltered {
                provider: "azure-openai".into(),
                detail: "finish_reason=content_filter".into(),
            })
        }
        Some("length") => {
            warn!("Azure OpenAI reply truncated at the output limit");
            true
        }
        _ => false,
    };
    Ok(Generation {
        text,
        truncated,
        input_tokens: response.usage.as_ref().and_then(|u| u.prompt_tokens),
        output_tokens: response.usage.as_ref().and_then(|u| u.completion_tokens),
    })
}

// ── Gemini ───────────────────────────────────────────────────────────────

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Google Gemini `generateContent`.
pub struct GeminiAdapter {
    client: reqwest::Client,
    model: String,
    key: String,
    output_cap: usize,
    timeout: Duration,
}

impl GeminiAdapter {
    pub fn new(
        credentials: &Credentials,
        model: &str,
        output_cap: usize,
        timeout: Duration,
    ) -> Result<Self, GenerateError> {
        let Some(key) = credentials.gemini_api_key.as_ref() else {
            return Err(GenerateError::CredentialsMissing {
                provider: "gemini".into(),
                hint: "Set GEMINI_API_KEY.".into(),
            });
        };
        Ok(Self {
            client: http_client(timeout, "gemini")?,
            model: model.to_string(),
            key: key.clone(),
            output_cap,
            timeout,
        })
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, GenerateError> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_output_tokens.min(self.output_cap),
                top_p: options.top_p,
                stop_sequences: &options.stop_sequences,
            },
        };

        let response = self
            .client
            .post(format!("{GEMINI_BASE_URL}/{}:generateContent", self.model))
            .query(&[("key", self.key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("gemini", e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("gemini", e, self.timeout))?;
        if !status.is_success() {
            return Err(status_error("gemini", status.as_u16(), &body));
        }

        let parsed: GeminiResponse =
            serde_json::from_str(&body).map_err(|e| GenerateError::MalformedResponse {
                provider: "gemini".into(),
                detail: e.to_string(),
            })?;
        interpret_gemini(parsed)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    generation_config: GeminiGenerationConfig<'a>,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig<'a> {
    temperature: f32,
    max_output_tokens: usize,
    top_p: f32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiFeedback>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiReplyPart>,
}

#[derive(Deserialize)]
struct GeminiReplyPart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<usize>,
    candidates_token_count: Option<usize>,
}

fn interpret_gemini(response: GeminiResponse) -> Result<Generation, GenerateError> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates returned".into());
        return Err(GenerateError::ContentFiltered {
            provider: "gemini".into(),
            detail: reason,
        });
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    let truncated = match candidate.finish_reason.as_deref() {
        Some("SAFETY") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") if text.is_empty() => {
            return Err(GenerateError::ContentFiltered {
                provider: "gemini".into(),
                detail: candidate.finish_reason.unwrap_or_default(),
            })
        }
        Some("MAX_TOKENS") => {
            warn!("Gemini reply truncated at the output limit");
            true
        }
        _ => false,
    };

    Ok(Generation {
        text,
        truncated,
        input_tokens: response.usage_metadata.as_ref().and_then(|u| u.prompt_token_count),
        output_tokens: response
            .usage_metadata
            .as_ref()
            .and_then(|u| u.candidates_token_count),
    })
}

// ── edgequake-llm factory ────────────────────────────────────────────────

/// Any provider the `edgequake-llm` factory can build.
pub struct FactoryAdapter {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl FactoryAdapter {
    /// `auto` detects the provider from the environment; any other name is
    /// created with the given model.
    pub fn new(name: &str, model: &str) -> Result<Self, GenerateError> {
        let provider = if name == "auto" {
            ProviderFactory::from_env()
                .map(|(llm, _embedding)| llm)
                .map_err(|e| GenerateError::CredentialsMissing {
                    provider: "auto".into(),
                    hint: format!(
                        "No LLM provider could be auto-detected from environment.\n\
                         Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or name a provider.\n\
                         Error: {e}"
                    ),
                })?
        } else {
            ProviderFactory::create_llm_provider(name, model).map_err(|e| {
                GenerateError::CredentialsMissing {
                    provider: name.to_string(),
                    hint: format!("{e}"),
                }
            })?
        };
        Ok(Self {
            provider,
            label: format!("{name}/{model}"),
        })
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<Generation, GenerateError> {
        let messages = vec![ChatMessage::user(prompt)];
        let completion = completion_options(options);

        match self.provider.chat(&messages, Some(&completion)).await {
            Ok(response) => interpret_factory(&self.label, response, options.max_output_tokens),
            Err(e) => Err(classify_message(&self.label, &e.to_string())),
        }
    }
}

fn completion_options(options: &GenerationOptions) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(options.temperature),
        max_tokens: Some(options.max_output_tokens),
        top_p: Some(options.top_p),
        stop: (!options.stop_sequences.is_empty()).then(|| options.stop_sequences.clone()),
        ..Default::default()
    }
}

/// `finish_reason` decides truncation; providers that leave it unset are
/// judged by whether the reply used the whole output budget.
fn interpret_factory(
    label: &str,
    response: LLMResponse,
    max_output_tokens: usize,
) -> Result<Generation, GenerateError> {
    let truncated = match response.finish_reason.as_deref() {
        Some("content_filter") if response.content.is_empty() => {
            return Err(GenerateError::ContentFiltered {
                provider: label.to_string(),
                detail: "finish_reason=content_filter".into(),
            })
        }
        Some("length") | Some("max_tokens") | Some("MAX_TOKENS") => true,
        Some(_) => false,
        None => response.completion_tokens >= max_output_tokens,
    };
    if truncated {
        warn!("{label} reply truncated at the output limit");
    }
    Ok(Generation {
        text: response.content,
        truncated,
        input_tokens: Some(response.prompt_tokens),
        output_tokens: Some(response.completion_tokens),
    })
}

// ── Error translation ────────────────────────────────────────────────────

fn http_client(timeout: Duration, provider: &str) -> Result<reqwest::Client, GenerateError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| GenerateError::RateLimitOrNetwork {
            provider: provider.to_string(),
            detail: format!("HTTP client: {e}"),
        })
}

fn transport_error(provider: &str, e: reqwest::Error, timeout: Duration) -> GenerateError {
    if e.is_timeout() {
        GenerateError::Timeout {
            secs: timeout.as_secs(),
        }
    } else {
        GenerateError::RateLimitOrNetwork {
            provider: provider.to_string(),
            detail: e.to_string(),
        }
    }
}

/// Map a non-success HTTP status and body onto the error taxonomy.
fn status_error(provider: &str, status: u16, body: &str) -> GenerateError {
    let detail: String = body.chars().take(300).collect();
    if status == 429 || status >= 500 {
        GenerateError::RateLimitOrNetwork {
            provider: provider.to_string(),
            detail: format!("HTTP {status}: {detail}"),
        }
    } else if is_content_filter(body) {
        GenerateError::ContentFiltered {
            provider: provider.to_string(),
            detail,
        }
    } else {
        GenerateError::Api {
            provider: provider.to_string(),
            status,
            detail,
        }
    }
}

/// Factory errors arrive as text; sort them by what they say.
fn classify_message(provider: &str, message: &str) -> GenerateError {
    let lower = message.to_ascii_lowercase();
    if is_content_filter(message) {
        GenerateError::ContentFiltered {
            provider: provider.to_string(),
            detail: message.to_string(),
        }
    } else if lower.contains("timeout") || lower.contains("timed out") {
        GenerateError::Timeout { secs: 0 }
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("400")
        || lower.contains("invalid api key")
        || lower.contains("unauthorized")
    {
        GenerateError::Api {
            provider: provider.to_string(),
            status: 400,
            detail: message.to_string(),
        }
    } else {
        GenerateError::RateLimitOrNetwork {
            provider: provider.to_string(),
            detail: message.to_string(),
        }
    }
}

fn is_content_filter(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("content_filter")
        || lower.contains("content filter")
        || lower.contains("responsibleaipolicyviolation")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gemini(json: &str) -> Result<Generation, GenerateError> {
        interpret_gemini(serde_json::from_str(json).unwrap())
    }

    fn azure(json: &str) -> Result<Generation, GenerateError> {
        interpret_azure(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn gemini_text_joined_from_parts() {
        let g = gemini(
            r#"{"candidates":[{"content":{"parts":[{"text":"[{\"a\":"},{"text":"1}]"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(g.text, "[{\"a\":1}]");
        assert!(!g.truncated);
    }

    #[test]
    fn gemini_max_tokens_keeps_partial_text() {
        let g = gemini(
            r#"{"candidates":[{"content":{"parts":[{"text":"[{\"a\":1},"}]},"finishReason":"MAX_TOKENS"}],
                "usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":8192}}"#,
        )
        .unwrap();
        assert!(g.truncated);
        assert_eq!(g.text, "[{\"a\":1},");
        assert_eq!(g.output_tokens, Some(8192));
    }

    #[test]
    fn gemini_block_is_content_filtered() {
        let err = gemini(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap_err();
        assert!(matches!(err, GenerateError::ContentFiltered { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn azure_length_is_truncation() {
        let g = azure(
            r#"{"choices":[{"message":{"content":"partial"},"finish_reason":"length"}],
                "usage":{"prompt_tokens":5,"completion_tokens":4096}}"#,
        )
        .unwrap();
        assert!(g.truncated);
        assert_eq!(g.text, "partial");
    }

    #[test]
    fn azure_content_filter_is_distinct() {
        let err = azure(r#"{"choices":[{"message":{"content":null},"finish_reason":"content_filter"}]}"#)
            .unwrap_err();
        assert!(matches!(err, GenerateError::ContentFiltered { .. }));
    }

    #[test]
    fn status_mapping() {
        assert!(status_error("gemini", 429, "slow down").is_retryable());
        assert!(status_error("gemini", 503, "").is_retryable());
        assert!(matches!(
            status_error("azure-openai", 400, r#"{"error":{"code":"content_filter"}}"#),
            GenerateError::ContentFiltered { .. }
        ));
        assert!(matches!(
            status_error("azure-openai", 401, "bad key"),
            GenerateError::Api { status: 401, .. }
        ));
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let config = PipelineConfig::default();
        let creds = Credentials::default();
        let err = GenerationClient::from_selection(&ProviderSelection::new("gemini", "gemini-1.0-pro"), &creds, &config)
            .unwrap_err();
        assert!(matches!(err, GenerateError::CredentialsMissing { .. }));

        let err = GenerationClient::from_selection(&ProviderSelection::new("openai", "gpt-4o"), &creds, &config)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn unsupported_model_rejected_before_credentials() {
        let err = GenerationClient::from_selection(
            &ProviderSelection::new("gemini", "gpt-4o"),
            &Credentials::default(),
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GenerateError::UnsupportedModel { .. }));
    }

    /// Replies with a fixed response and keeps the options it was called with.
    struct StubProvider {
        response: LLMResponse,
        seen: std::sync::Mutex<Option<CompletionOptions>>,
    }

    #[async_trait]
    impl LLMProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn model(&self) -> &str {
            "stub-1"
        }

        fn max_context_length(&self) -> usize {
            8_192
        }

        async fn complete(&self, prompt: &str) -> edgequake_llm::Result<LLMResponse> {
            self.complete_with_options(prompt, &CompletionOptions::default()).await
        }

        async fn complete_with_options(
            &self,
            _prompt: &str,
            options: &CompletionOptions,
        ) -> edgequake_llm::Result<LLMResponse> {
            *self.seen.lock().unwrap() = Some(options.clone());
            Ok(self.response.clone())
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            options: Option<&CompletionOptions>,
        ) -> edgequake_llm::Result<LLMResponse> {
            *self.seen.lock().unwrap() = options.cloned();
            Ok(self.response.clone())
        }
    }

    fn stub(response: LLMResponse) -> (Arc<StubProvider>, GenerationClient) {
        let provider = Arc::new(StubProvider {
            response,
            seen: std::sync::Mutex::new(None),
        });
        let client = GenerationClient::from_provider(provider.clone(), "stub/stub-1");
        (provider, client)
    }

    #[tokio::test]
    async fn factory_passes_sampling_options_through() {
        let (provider, client) = stub(LLMResponse::new("[]", "stub-1").with_usage(10, 2));
        let options = GenerationOptions {
            top_p: 0.8,
            stop_sequences: vec!["END".into()],
            ..GenerationOptions::default()
        };

        let g = client.generate("prompt", &options).await.unwrap();
        assert!(!g.truncated);

        let seen = provider.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.top_p, Some(0.8));
        assert_eq!(seen.stop, Some(vec!["END".to_string()]));
        assert_eq!(seen.max_tokens, Some(options.max_output_tokens));
    }

    #[tokio::test]
    async fn factory_length_finish_is_truncation_below_the_cap() {
        // The provider stopped at its own limit, well under the configured maximum.
        let (_provider, client) = stub(
            LLMResponse::new("[{\"a\":1},", "stub-1")
                .with_usage(10, 512)
                .with_finish_reason("length"),
        );
        let g = client
            .generate("prompt", &GenerationOptions::default())
            .await
            .unwrap();
        assert!(g.truncated);
        assert_eq!(g.text, "[{\"a\":1},");
        assert_eq!(g.output_tokens, Some(512));
    }

    #[test]
    fn factory_stop_finish_is_complete_and_filter_is_distinct() {
        let done = LLMResponse::new("[]", "m")
            .with_usage(1, 8192)
            .with_finish_reason("stop");
        assert!(!interpret_factory("stub", done, 8192).unwrap().truncated);

        let unknown = LLMResponse::new("[]", "m").with_usage(1, 8192);
        assert!(interpret_factory("stub", unknown, 8192).unwrap().truncated);

        let blocked = LLMResponse::new("", "m").with_finish_reason("content_filter");
        assert!(matches!(
            interpret_factory("stub", blocked, 8192),
            Err(GenerateError::ContentFiltered { .. })
        ));
    }

    #[test]
    fn gemini_request_shape() {
        let stops = vec!["END".to_string()];
        let req = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: "hi" }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: 0.5,
                max_output_tokens: 2048,
                top_p: 1.0,
                stop_sequences: &stops,
            },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(v["generationConfig"]["stopSequences"][0], "END");
        assert_eq!(v["contents"][0]["parts"][0]["text"], "hi");
    }
}
