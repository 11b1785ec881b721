//! Configuration types for extraction and comparison jobs.
//!
//! Every pipeline knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Credentials are kept apart in [`Credentials`]
//! so a config can be logged or serialised without leaking secrets, and the
//! backend choice for one job is a [`ProviderSelection`].
//!
//! Model limits come from [`ModelProfile`]: a built-in table for the models
//! the pipeline has been tuned against, per-config overrides, and a
//! conservative fallback for anything unknown.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Configuration for an extraction or comparison job.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use docextract::{ChunkingMode, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .chunking(ChunkingMode::Pages { pages_per_chunk: 2 })
///     .temperature(0.2)
///     .max_retries(1)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_retries, 1);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// How source text is cut into chunks. Default: token budget with a
    /// 200-token overlap.
    ///
    /// Page mode skips the up-front token check; oversized chunks are sent
    /// anyway and any failure is reported for that chunk alone.
    pub chunking: ChunkingMode,

    /// Pages per OCR request in token mode. Default: 30.
    ///
    /// In page mode the OCR request size follows `pages_per_chunk` so that
    /// one OCR segment maps onto one chunk.
    pub ocr_pages_per_request: usize,

    /// Concurrent OCR requests in flight. Default: 4.
    pub ocr_workers: usize,

    /// Per-OCR-call timeout in seconds. Default: 300.
    pub ocr_timeout_secs: u64,

    /// Sampling parameters sent with every generation call.
    pub generation: GenerationOptions,

    /// Per-generation-call timeout in seconds. Default: 180.
    pub api_timeout_secs: u64,

    /// Retry attempts on a retryable generation failure. Default: 2.
    ///
    /// Only rate limits, network errors, and timeouts are retried. Content
    /// filtering and 4xx errors fail the chunk immediately.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Field layout of extraction records.
    pub extraction: ExtractionSchema,

    /// Field names used to align records in a comparison.
    pub comparison: ComparisonKey,

    /// Per-model limits that take precedence over the built-in table.
    pub model_profiles: HashMap<String, ModelProfile>,

    /// Directory receiving spreadsheet artifacts. Default: the system temp dir.
    pub output_dir: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Download timeout for URL sources in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingMode::default(),
            ocr_pages_per_request: 30,
            ocr_workers: 4,
            ocr_timeout_secs: 300,
            generation: GenerationOptions::default(),
            api_timeout_secs: 180,
            max_retries: 2,
            retry_backoff_ms: 500,
            extraction: ExtractionSchema::default(),
            comparison: ComparisonKey::default(),
            model_profiles: HashMap::new(),
            output_dir: None,
            password: None,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("chunking", &self.chunking)
            .field("ocr_pages_per_request", &self.ocr_pages_per_request)
            .field("ocr_workers", &self.ocr_workers)
            .field("generation", &self.generation)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("extraction", &self.extraction)
            .field("comparison", &self.comparison)
            .field("output_dir", &self.output_dir)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Limits for `model`: config override, then built-in table, then the
    /// conservative fallback.
    pub fn model_profile(&self, model: &str) -> ModelProfile {
        self.model_profiles
            .get(model)
            .copied()
            .or_else(|| ModelProfile::builtin(model))
            .unwrap_or(ModelProfile::FALLBACK)
    }

    /// Pages sent per OCR request. Page mode uses `pages_per_chunk` so each
    /// OCR segment becomes exactly one chunk.
    pub fn ocr_request_pages(&self) -> usize {
        match self.chunking {
            ChunkingMode::Pages { pages_per_chunk } => pages_per_chunk.max(1),
            ChunkingMode::Tokens { .. } => self.ocr_pages_per_request,
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn chunking(mut self, mode: ChunkingMode) -> Self {
        self.config.chunking = mode;
        self
    }

    pub fn ocr_pages_per_request(mut self, n: usize) -> Self {
        self.config.ocr_pages_per_request = n.max(1);
        self
    }

    pub fn ocr_workers(mut self, n: usize) -> Self {
        self.config.ocr_workers = n.max(1);
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = secs;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.generation.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_output_tokens(mut self, n: usize) -> Self {
        self.config.generation.max_output_tokens = n;
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.generation.top_p = p.clamp(0.0, 1.0);
        self
    }

    pub fn stop_sequences(mut self, stops: Vec<String>) -> Self {
        self.config.generation.stop_sequences = stops;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn extraction(mut self, schema: ExtractionSchema) -> Self {
        self.config.extraction = schema;
        self
    }

    pub fn comparison(mut self, key: ComparisonKey) -> Self {
        self.config.comparison = key;
        self
    }

    pub fn model_profile(mut self, model: impl Into<String>, profile: ModelProfile) -> Self {
        self.config.model_profiles.insert(model.into(), profile);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if let ChunkingMode::Pages { pages_per_chunk } = c.chunking {
            if !(1..=50).contains(&pages_per_chunk) {
                return Err(PipelineError::InvalidConfig(format!(
                    "pages per chunk must be 1–50, got {pages_per_chunk}"
                )));
            }
        }
        if c.generation.max_output_tokens == 0 {
            return Err(PipelineError::InvalidConfig(
                "max output tokens must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 || c.ocr_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "timeouts must be ≥ 1 second".into(),
            ));
        }
        for (model, profile) in &c.model_profiles {
            if profile.max_input_tokens <= profile.safety_margin_tokens {
                return Err(PipelineError::InvalidConfig(format!(
                    "profile for '{model}': safety margin {} leaves no input budget of {}",
                    profile.safety_margin_tokens, profile.max_input_tokens
                )));
            }
        }
        if c.comparison.category_field.trim().is_empty()
            || c.comparison.attribute_field.trim().is_empty()
        {
            return Err(PipelineError::InvalidConfig(
                "comparison key field names must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Strategy for cutting source text into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingMode {
    /// Split by estimated tokens; consecutive chunks share up to
    /// `overlap_tokens` of text.
    Tokens { overlap_tokens: usize },
    /// One chunk per `pages_per_chunk` pages (1–50).
    Pages { pages_per_chunk: usize },
}

impl Default for ChunkingMode {
    fn default() -> Self {
        ChunkingMode::Tokens {
            overlap_tokens: 200,
        }
    }
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Range 0–2. Default: 0.5.
    pub temperature: f32,
    /// Default: 8192. Capped per model by the adapters that know the limit.
    pub max_output_tokens: usize,
    /// Nucleus sampling, range 0–1. Default: 1.0.
    pub top_p: f32,
    /// Sent only when non-empty.
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            max_output_tokens: 8192,
            top_p: 1.0,
            stop_sequences: Vec::new(),
        }
    }
}

/// Field layout of extraction records.
///
/// All lists empty (the default) means "take whatever fields the model
/// returns": nothing is filled in, a record is dropped only when every value
/// is blank, and duplicates are detected on full content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    /// Fields every record must carry; missing ones are filled with "".
    pub fields: Vec<String>,
    /// Fields that carry meaning. A record whose content fields are all blank
    /// is dropped. Empty list = every field.
    pub content_fields: Vec<String>,
    /// Fields forming the duplicate-detection key. Empty list = full content.
    pub key_fields: Vec<String>,
}

impl ExtractionSchema {
    /// The layout used by the default rule-extraction instruction.
    pub fn rules() -> Self {
        Self {
            fields: vec![
                "major_section".into(),
                "minor_section".into(),
                "rule".into(),
            ],
            content_fields: vec!["rule".into()],
            key_fields: vec!["major_section".into(), "minor_section".into(), "rule".into()],
        }
    }
}

/// Field names of the composite key used to align two record sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonKey {
    pub category_field: String,
    pub attribute_field: String,
}

impl Default for ComparisonKey {
    fn default() -> Self {
        Self {
            category_field: "Category".into(),
            attribute_field: "Attribute".into(),
        }
    }
}

// ── Model limits ─────────────────────────────────────────────────────────

/// Token limits for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Context window available for the prompt.
    pub max_input_tokens: usize,
    /// Hard cap on generated tokens.
    pub max_output_tokens: usize,
    /// Preferred chunk size; smaller chunks give the model less to skip over.
    pub recommended_chunk_tokens: usize,
    /// Tokens held back from the input window for role framing and, on
    /// reasoning models, internal thinking that draws on the same budget.
    pub safety_margin_tokens: usize,
}

impl ModelProfile {
    /// Used for models not in the built-in table or the config overrides.
    pub const FALLBACK: ModelProfile = ModelProfile::new(8_192, 2_048, 1_500, 512);

    pub const fn new(
        max_input_tokens: usize,
        max_output_tokens: usize,
        recommended_chunk_tokens: usize,
        safety_margin_tokens: usize,
    ) -> Self {
        Self {
            max_input_tokens,
            max_output_tokens,
            recommended_chunk_tokens,
            safety_margin_tokens,
        }
    }

    /// Built-in limits for known models.
    pub fn builtin(model: &str) -> Option<ModelProfile> {
        let p = match model {
            "gpt-4o" | "gpt-4o-mini" => Self::new(128_000, 16_384, 6_000, 1_024),
            "gpt-4-turbo" => Self::new(128_000, 4_096, 5_000, 1_024),
            "gpt-4" => Self::new(8_192, 4_096, 2_000, 512),
            "gpt-3.5-turbo" => Self::new(16_385, 4_096, 3_000, 512),
            "gpt-4.1" | "gpt-4.1-mini" | "gpt-4.1-nano" => {
                Self::new(1_047_576, 32_768, 8_000, 1_024)
            }
            // Reasoning models spend hidden tokens before answering.
            "o1" | "o3" | "o3-mini" | "o4-mini" => Self::new(200_000, 100_000, 6_000, 25_000),
            "gemini-1.5-pro-latest" => Self::new(1_000_000, 8_192, 8_000, 1_024),
            "gemini-1.5-flash-latest" => Self::new(1_000_000, 8_192, 4_000, 1_024),
            "gemini-1.0-pro" => Self::new(30_720, 2_048, 2_000, 512),
            "gemini-2.5-pro" | "gemini-2.5-flash" => {
                Self::new(1_048_576, 65_536, 8_000, 8_192)
            }
            _ => return None,
        };
        Some(p)
    }
}

// ── Provider selection ───────────────────────────────────────────────────

/// Backend family for generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Azure-hosted OpenAI deployment.
    AzureOpenAi,
    /// Google Gemini `generateContent`.
    Gemini,
    /// Any provider known to the edgequake-llm factory, by name.
    Factory(String),
}

impl ProviderKind {
    /// Parse a provider name. `openai` and `azure` both mean Azure OpenAI;
    /// unknown names are handed to the provider factory.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" | "azure" | "azure-openai" | "azure_openai" => ProviderKind::AzureOpenAi,
            "gemini" | "google" => ProviderKind::Gemini,
            other => ProviderKind::Factory(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProviderKind::AzureOpenAi => "azure-openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Factory(name) => name,
        }
    }

    /// Models accepted for the validated families. `None` for factory
    /// providers, which do their own validation.
    pub fn supported_models(&self) -> Option<&'static [&'static str]> {
        match self {
            ProviderKind::AzureOpenAi => Some(&[
                "gpt-4o",
                "gpt-4o-mini",
                "gpt-4-turbo",
                "gpt-4",
                "gpt-3.5-turbo",
                "gpt-4.1",
                "gpt-4.1-mini",
                "gpt-4.1-nano",
                "o1",
                "o3",
                "o3-mini",
                "o4-mini",
            ]),
            ProviderKind::Gemini => Some(&[
                "gemini-1.5-pro-latest",
                "gemini-1.5-flash-latest",
                "gemini-1.0-pro",
                "gemini-2.5-pro",
                "gemini-2.5-flash",
            ]),
            ProviderKind::Factory(_) => None,
        }
    }
}

/// The provider + model pair chosen for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub model: String,
}

impl ProviderSelection {
    pub fn new(provider: &str, model: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::parse(provider),
            model: model.into(),
        }
    }

    /// Reject models outside the supported list of a validated family.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.model.trim().is_empty() {
            return Err(PipelineError::UnsupportedModel {
                provider: self.provider.name().to_string(),
                model: self.model.clone(),
            });
        }
        match self.provider.supported_models() {
            Some(models) if !models.contains(&self.model.as_str()) => {
                Err(PipelineError::UnsupportedModel {
                    provider: self.provider.name().to_string(),
                    model: self.model.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ProviderSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider.name(), self.model)
    }
}

// ── Credentials ──────────────────────────────────────────────────────────

/// Secrets for the external collaborators. Never logged.
#[derive(Clone, Default)]
pub struct Credentials {
    pub azure_openai_api_key: Option<String>,
    pub azure_openai_endpoint: Option<String>,
    pub azure_openai_deployment: Option<String>,
    pub gemini_api_key: Option<String>,
    pub document_intelligence_endpoint: Option<String>,
    pub document_intelligence_key: Option<String>,
}

impl Credentials {
    /// Load credentials from the environment. Blank values count as absent.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `AZURE_OPENAI_API_KEY` | `azure_openai_api_key` |
    /// | `AZURE_OPENAI_ENDPOINT` | `azure_openai_endpoint` |
    /// | `AZURE_OPENAI_DEPLOYMENT` | `azure_openai_deployment` |
    /// | `GEMINI_API_KEY` | `gemini_api_key` |
    /// | `AZURE_DI_ENDPOINT` | `document_intelligence_endpoint` |
    /// | `AZURE_DI_KEY` | `document_intelligence_key` |
    pub fn from_env() -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            azure_openai_api_key: var("AZURE_OPENAI_API_KEY"),
            azure_openai_endpoint: var("AZURE_OPENAI_ENDPOINT"),
            azure_openai_deployment: var("AZURE_OPENAI_DEPLOYMENT"),
            gemini_api_key: var("GEMINI_API_KEY"),
            document_intelligence_endpoint: var("AZURE_DI_ENDPOINT"),
            document_intelligence_key: var("AZURE_DI_KEY"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn mask(v: &Option<String>) -> &'static str {
            if v.is_some() {
                "<set>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("Credentials")
            .field("azure_openai_api_key", &mask(&self.azure_openai_api_key))
            .field("azure_openai_endpoint", &self.azure_openai_endpoint)
            .field("azure_openai_deployment", &self.azure_openai_deployment)
            .field("gemini_api_key", &mask(&self.gemini_api_key))
            .field(
                "document_intelligence_endpoint",
                &self.document_intelligence_endpoint,
            )
            .field(
                "document_intelligence_key",
                &mask(&self.document_intelligence_key),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.ocr_pages_per_request, 30);
        assert_eq!(c.ocr_workers, 4);
        assert_eq!(c.generation.temperature, 0.5);
        assert_eq!(c.generation.max_output_tokens, 8192);
        assert_eq!(
            c.chunking,
            ChunkingMode::Tokens {
                overlap_tokens: 200
            }
        );
    }

    #[test]
    fn page_mode_sizes_ocr_requests_by_chunk() {
        let tokens = PipelineConfig::default();
        assert_eq!(tokens.ocr_request_pages(), 30);
        let pages = PipelineConfig::builder()
            .chunking(ChunkingMode::Pages { pages_per_chunk: 2 })
            .build()
            .unwrap();
        assert_eq!(pages.ocr_request_pages(), 2);
    }

    #[test]
    fn builder_clamps_sampling() {
        let c = PipelineConfig::builder()
            .temperature(9.0)
            .top_p(-1.0)
            .ocr_workers(0)
            .build()
            .unwrap();
        assert_eq!(c.generation.temperature, 2.0);
        assert_eq!(c.generation.top_p, 0.0);
        assert_eq!(c.ocr_workers, 1);
    }

    #[test]
    fn pages_per_chunk_validated() {
        let err = PipelineConfig::builder()
            .chunking(ChunkingMode::Pages { pages_per_chunk: 51 })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("1–50"));
    }

    #[test]
    fn profile_lookup_order() {
        let custom = ModelProfile::new(1000, 100, 300, 50);
        let c = PipelineConfig::builder()
            .model_profile("gpt-4", custom)
            .build()
            .unwrap();
        assert_eq!(c.model_profile("gpt-4"), custom);
        assert_eq!(c.model_profile("gpt-4o").max_output_tokens, 16_384);
        assert_eq!(c.model_profile("mystery"), ModelProfile::FALLBACK);
    }

    #[test]
    fn provider_parsing_and_validation() {
        assert_eq!(ProviderKind::parse("OpenAI"), ProviderKind::AzureOpenAi);
        assert_eq!(ProviderKind::parse("gemini"), ProviderKind::Gemini);
        assert_eq!(
            ProviderKind::parse("ollama"),
            ProviderKind::Factory("ollama".into())
        );

        assert!(ProviderSelection::new("openai", "gpt-4o").validate().is_ok());
        assert!(ProviderSelection::new("gemini", "gpt-4o").validate().is_err());
        assert!(ProviderSelection::new("ollama", "llama3").validate().is_ok());
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let creds = Credentials {
            gemini_api_key: Some("super-secret".into()),
            ..Default::default()
        };
        let shown = format!("{creds:?}");
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("<set>"));
    }
}
