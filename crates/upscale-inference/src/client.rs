//! Inference endpoint interface and HTTP client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use upscale_models::{ModelType, Resolution};

use crate::error::{InferenceError, InferenceResult};

/// Frames with a side longer than this are upscaled in tiles.
pub const TILING_THRESHOLD_PX: u32 = 1500;

/// Tile edge requested for large frames.
pub const TILE_SIZE: u32 = 1024;

/// Upscaling factor of the models.
pub const OUTSCALE: u32 = 4;

/// Per-request model parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceParams {
    pub model_type: ModelType,
    /// 0 disables tiling
    pub tile_size: u32,
    pub outscale: u32,
}

impl InferenceParams {
    /// Parameters for frames of the given resolution.
    pub fn for_resolution(model_type: ModelType, resolution: Resolution) -> Self {
        let tile_size = if resolution.max_dimension() > TILING_THRESHOLD_PX {
            TILE_SIZE
        } else {
            0
        };
        Self {
            model_type,
            tile_size,
            outscale: OUTSCALE,
        }
    }
}

/// Super-resolution model behind some transport.
#[async_trait]
pub trait InferenceEndpoint: Send + Sync {
    /// Upscale the image at `input_path` into `output_path`.
    ///
    /// Returns the path the endpoint reports having written.
    async fn infer(
        &self,
        input_path: &Path,
        output_path: &Path,
        params: &InferenceParams,
    ) -> InferenceResult<PathBuf>;
}

/// Inference client configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Full URL of the invocation endpoint
    pub endpoint_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
}

impl InferenceConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> InferenceResult<Self> {
        let endpoint_url = std::env::var("INFERENCE_ENDPOINT_URL")
            .map_err(|_| InferenceError::Config("INFERENCE_ENDPOINT_URL not set".to_string()))?;

        let timeout_secs: u64 = std::env::var("INFERENCE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        Ok(Self {
            timeout: Duration::from_secs(timeout_secs),
            ..Self::new(endpoint_url)
        })
    }
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    input_file_path: &'a str,
    output_file_path: &'a str,
    model_type: &'static str,
    tile_size: u32,
    outscale: u32,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    status: u16,
    #[serde(default)]
    output_file_path: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// JSON-over-HTTP inference client.
#[derive(Clone)]
pub struct InferenceClient {
    http: Client,
    config: InferenceConfig,
}

impl InferenceClient {
    pub fn new(config: InferenceConfig) -> InferenceResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("upscale-inference/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, config })
    }

    pub fn from_env() -> InferenceResult<Self> {
        Self::new(InferenceConfig::from_env()?)
    }
}

#[async_trait]
impl InferenceEndpoint for InferenceClient {
    async fn infer(
        &self,
        input_path: &Path,
        output_path: &Path,
        params: &InferenceParams,
    ) -> InferenceResult<PathBuf> {
        let input = input_path.to_string_lossy();
        let output = output_path.to_string_lossy();
        let request = InferenceRequest {
            input_file_path: &input,
            output_file_path: &output,
            model_type: params.model_type.as_str(),
            tile_size: params.tile_size,
            outscale: params.outscale,
        };

        debug!(input = %input, tile_size = params.tile_size, "Invoking inference endpoint");

        let response = self
            .http
            .post(&self.config.endpoint_url)
            .json(&request)
            .send()
            .await?;

        let http_status = response.status();
        if !http_status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::endpoint(http_status.as_u16(), body));
        }

        let body: InferenceResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;

        if body.status != 200 {
            return Err(InferenceError::endpoint(
                body.status,
                body.error.unwrap_or_else(|| "no error message".to_string()),
            ));
        }

        body.output_file_path
            .map(PathBuf::from)
            .ok_or_else(|| InferenceError::InvalidResponse("missing output_file_path".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_tiling_threshold() {
        let small = InferenceParams::for_resolution(ModelType::Realesrgan, Resolution::new(1500, 1000));
        assert_eq!(small.tile_size, 0);
        assert_eq!(small.outscale, 4);

        let large = InferenceParams::for_resolution(ModelType::Realesrgan, Resolution::new(1080, 1920));
        assert_eq!(large.tile_size, 1024);
    }

    async fn client_for(server: &MockServer) -> InferenceClient {
        InferenceClient::new(InferenceConfig::new(format!("{}/invocations", server.uri()))).unwrap()
    }

    #[tokio::test]
    async fn test_infer_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invocations"))
            .and(body_partial_json(json!({
                "input_file_path": "/work/in/000001.png",
                "model_type": "swinir",
                "tile_size": 1024,
                "outscale": 4
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 200,
                "output_file_path": "/work/out/000001.png"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let params = InferenceParams::for_resolution(ModelType::Swinir, Resolution::new(3840, 2160));
        let output = client_for(&server)
            .await
            .infer(
                Path::new("/work/in/000001.png"),
                Path::new("/work/out/000001.png"),
                &params,
            )
            .await
            .unwrap();

        assert_eq!(output, PathBuf::from("/work/out/000001.png"));
    }

    #[tokio::test]
    async fn test_infer_reports_model_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 500,
                "error": "CUDA out of memory"
            })))
            .mount(&server)
            .await;

        let params = InferenceParams::for_resolution(ModelType::Realesrgan, Resolution::new(640, 480));
        let err = client_for(&server)
            .await
            .infer(Path::new("/a.png"), Path::new("/b.png"), &params)
            .await
            .unwrap_err();

        assert!(matches!(err, InferenceError::Endpoint { status: 500, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_infer_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let params = InferenceParams::for_resolution(ModelType::Realesrgan, Resolution::new(640, 480));
        let err = client_for(&server)
            .await
            .infer(Path::new("/a.png"), Path::new("/b.png"), &params)
            .await
            .unwrap_err();

        match err {
            InferenceError::Endpoint { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
