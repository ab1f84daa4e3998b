use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{header, Client, Url};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{select_best, InferenceError, PlateCandidate, RecognitionResult, Recognizer};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Plate-reader endpoint, e.g. `http://localhost:8080/v1/plate-reader/`.
    pub url: String,
    /// Sent as `Authorization: Token <token>` when present.
    pub token: Option<String>,
    pub timeout: Duration,
}

/// Client for an ALPR service speaking the Plate Recognizer API.
///
/// The image is uploaded as the `upload` multipart field and every reading in
/// `results` becomes a [`PlateCandidate`].
pub struct HttpAlprEngine {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EngineResponse {
    #[serde(default)]
    results: Vec<EngineReading>,
}

#[derive(Debug, Deserialize)]
struct EngineReading {
    plate: String,
    score: f64,
}

impl HttpAlprEngine {
    pub fn new(config: EngineConfig) -> Result<Self, InferenceError> {
        let endpoint = Url::parse(&config.url)
            .map_err(|e| InferenceError::Config(format!("{}: {}", config.url, e)))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InferenceError::Config(e.to_string()))?;

        info!("Using ALPR engine at {}", endpoint);

        Ok(Self {
            client,
            endpoint,
            token: config.token.filter(|t| !t.is_empty()),
        })
    }

    /// Confirm the service is up before accepting uploads.
    ///
    /// Plate-reader endpoints usually answer GET with 405, so any response
    /// short of a server error counts as available.
    pub async fn check(&self) -> Result<(), InferenceError> {
        let mut request = self.client.get(self.endpoint.clone());
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(InferenceError::Status(status.to_string()));
        }
        debug!("ALPR engine answered {} at {}", status, self.endpoint);
        Ok(())
    }

    async fn read_candidates(&self, image_path: &Path) -> Result<Vec<PlateCandidate>, InferenceError> {
        read_image_header(image_path).await?;

        let data = tokio::fs::read(image_path)
            .await
            .map_err(|e| InferenceError::Image(e.to_string()))?;
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.jpg".into());
        let form = Form::new().part("upload", Part::bytes(data).file_name(file_name));

        let mut request = self.client.post(self.endpoint.clone()).multipart(form);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".into());
            return Err(InferenceError::Status(format!("{}: {}", status, body.trim())));
        }

        let body: EngineResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;

        Ok(body
            .results
            .into_iter()
            .map(|reading| PlateCandidate {
                text: reading.plate,
                score: reading.score,
            })
            .collect())
    }
}

#[async_trait]
impl Recognizer for HttpAlprEngine {
    async fn recognize(&self, image_path: &Path) -> Result<RecognitionResult, InferenceError> {
        let candidates = self.read_candidates(image_path).await?;
        debug!(
            "ALPR engine returned {} candidates for {}",
            candidates.len(),
            image_path.display()
        );
        Ok(select_best(candidates))
    }
}

/// Reject files the engine could never read (empty, truncated, not an image)
/// before spending a request on them.
async fn read_image_header(image_path: &Path) -> Result<(), InferenceError> {
    let path: PathBuf = image_path.to_path_buf();
    tokio::task::spawn_blocking(move || image::image_dimensions(&path))
        .await
        .map_err(|e| InferenceError::Image(e.to_string()))?
        .map(|_| ())
        .map_err(|e| InferenceError::Image(e.to_string()))
}
