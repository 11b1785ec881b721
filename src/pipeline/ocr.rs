//! OCR collaborator: turn one page-range document into text.
//!
//! [`OcrEngine`] is the narrow contract the document reader depends on.
//! [`DocumentIntelligenceOcr`] implements it against the Azure Document
//! Intelligence `prebuilt-layout` model: upload, then poll the returned
//! operation until it settles.
//!
//! Text assembly follows the page structure of the analysis: paragraphs are
//! grouped by the page of their first bounding region, joined with a newline
//! inside a page and a blank line between pages.

use crate::config::Credentials;
use crate::error::{OcrError, PipelineError};
use crate::pipeline::split::PageRange;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Async OCR contract. Implementations must be cheap to share across tasks.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Extract the text of `segment`, which holds `range` of the source.
    async fn analyze(&self, segment: &Path, range: PageRange) -> Result<String, OcrError>;
}

const API_VERSION: &str = "2023-07-31";
const DEFAULT_MODEL: &str = "prebuilt-layout";

/// Azure Document Intelligence over REST.
#[derive(Clone)]
pub struct DocumentIntelligenceOcr {
    client: reqwest::Client,
    endpoint: String,
    key: String,
    model: String,
    poll_interval: Duration,
}

impl std::fmt::Debug for DocumentIntelligenceOcr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentIntelligenceOcr")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl DocumentIntelligenceOcr {
    /// Build from credentials. Endpoint and key are both required.
    pub fn from_credentials(credentials: &Credentials) -> Result<Self, PipelineError> {
        let (Some(endpoint), Some(key)) = (
            credentials.document_intelligence_endpoint.as_ref(),
            credentials.document_intelligence_key.as_ref(),
        ) else {
            return Err(PipelineError::ProviderNotConfigured {
                provider: "document-intelligence".into(),
                hint: "Set AZURE_DI_ENDPOINT and AZURE_DI_KEY.".into(),
            });
        };
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key: key.clone(),
            model: DEFAULT_MODEL.to_string(),
            poll_interval: Duration::from_secs(1),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/formrecognizer/documentModels/{}:analyze?api-version={}",
            self.endpoint, self.model, API_VERSION
        )
    }

    async fn submit(&self, bytes: Vec<u8>) -> Result<String, OcrError> {
        let response = self
            .client
            .post(self.analyze_url())
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(bytes)
            .send()
            .await
            .map_err(|e| OcrError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Request(format!("HTTP {status}: {}", truncate(&body, 300))));
        }

        response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| OcrError::Request("response missing Operation-Location".into()))
    }

    async fn poll(&self, operation: &str) -> Result<AnalyzeResult, OcrError> {
        loop {
            let response = self
                .client
                .get(operation)
                .header("Ocp-Apim-Subscription-Key", &self.key)
                .send()
                .await
                .map_err(|e| OcrError::Request(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(OcrError::Request(format!("HTTP {status}: {}", truncate(&body, 300))));
            }

            let op: AnalyzeOperation = response
                .json()
                .await
                .map_err(|e| OcrError::Request(format!("undecodable operation: {e}")))?;

            match op.status.as_str() {
                "succeeded" => {
                    return op
                        .analyze_result
                        .ok_or_else(|| OcrError::AnalysisFailed("succeeded without a result".into()))
                }
                "failed" | "canceled" => {
                    let detail = op
                        .error
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| op.status.clone());
                    return Err(OcrError::AnalysisFailed(detail));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl OcrEngine for DocumentIntelligenceOcr {
    async fn analyze(&self, segment: &Path, range: PageRange) -> Result<String, OcrError> {
        let bytes = tokio::fs::read(segment).await?;
        debug!("OCR submit {range} ({} bytes)", bytes.len());
        let operation = self.submit(bytes).await?;
        let result = self.poll(&operation).await?;
        let text = assemble_text(&result);
        debug!("OCR {range}: {} pages, {} chars", result.pages.len(), text.len());
        Ok(text)
    }
}

// ── Response shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    status: String,
    analyze_result: Option<AnalyzeResult>,
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AnalyzeResult {
    #[serde(default)]
    pages: Vec<AnalyzedPage>,
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzedPage {
    page_number: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Paragraph {
    content: String,
    #[serde(default)]
    bounding_regions: Vec<BoundingRegion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoundingRegion {
    page_number: u32,
}

/// Page-ordered text of one analysis.
pub(crate) fn assemble_text(result: &AnalyzeResult) -> String {
    let mut page_numbers: Vec<u32> = result.pages.iter().map(|p| p.page_number).collect();
    page_numbers.sort_unstable();
    page_numbers.dedup();

    page_numbers
        .iter()
        .map(|&page| {
            result
                .paragraphs
                .iter()
                .filter(|p| p.bounding_regions.first().map(|r| r.page_number) == Some(page))
                .map(|p| p.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_grouped_by_page() {
        let raw = r#"{
            "pages": [{"pageNumber": 2}, {"pageNumber": 1}],
            "paragraphs": [
                {"content": "Title", "boundingRegions": [{"pageNumber": 1}]},
                {"content": "Second page", "boundingRegions": [{"pageNumber": 2}]},
                {"content": "Body", "boundingRegions": [{"pageNumber": 1}]},
                {"content": "Floating"}
            ]
        }"#;
        let result: AnalyzeResult = serde_json::from_str(raw).unwrap();
        assert_eq!(assemble_text(&result), "Title\nBody\n\nSecond page");
    }

    #[test]
    fn missing_credentials_is_configuration_error() {
        let err = DocumentIntelligenceOcr::from_credentials(&Credentials::default()).unwrap_err();
        assert!(matches!(err, PipelineError::ProviderNotConfigured { .. }));
    }

    #[test]
    fn analyze_url_shape() {
        let creds = Credentials {
            document_intelligence_endpoint: Some("https://di.example.com/".into()),
            document_intelligence_key: Some("k".into()),
            ..Default::default()
        };
        let ocr = DocumentIntelligenceOcr::from_credentials(&creds).unwrap();
        assert_eq!(
            ocr.analyze_url(),
            "https://di.example.com/formrecognizer/documentModels/prebuilt-layout:analyze?api-version=2023-07-31"
        );
    }
}
