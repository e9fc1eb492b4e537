//! Document rendering collaborator.
//!
//! The renderer turns a template id plus a context map into PDF bytes.
//! Production uses the HTTP renderer service; tests swap in the mock via
//! the trait object held by the application state.

use async_trait::async_trait;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Serialize)]
pub struct RenderRequest {
    pub template_id: String,
    pub context: BTreeMap<String, serde_json::Value>,
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, AppError>;
}

/// Renderer backed by the HTTP rendering service.
pub struct HttpRenderer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRenderer {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DocumentRenderer for HttpRenderer {
    #[instrument(skip(self, request), fields(template_id = %request.template_id))]
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, AppError> {
        let url = format!("{}/render", self.base_url);
        debug!(url = %url, "Requesting document render");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| AppError::RenderError(format!("Renderer unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::RenderError(format!(
                "Renderer returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::RenderError(format!("Failed to read render body: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

/// In-memory renderer for tests. Returns a fixed payload and counts calls;
/// can be flipped to fail to exercise the retry path.
#[derive(Default)]
pub struct MockRenderer {
    pub calls: AtomicU64,
    pub fail: AtomicBool,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentRenderer for MockRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::RenderError("mock render failure".to_string()));
        }
        Ok(format!("%PDF-mock {}", request.template_id).into_bytes())
    }
}
