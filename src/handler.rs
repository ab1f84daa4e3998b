use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use notification::{DispatchOutcome, WebhookDispatcher};
use plate_recognizer::{RecognitionResult, Recognizer};
use plate_registry::PlateRegistry;
use tracing::{debug, error, info};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Called by the FTP host once per completed upload.
#[async_trait]
pub trait UploadListener: Send + Sync {
    async fn on_file_received(&self, path: &Path, filename: &str);
}

/// What happened to one uploaded image.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub filename: String,
    pub result: RecognitionResult,
    pub known: bool,
    pub webhook: DispatchOutcome,
}

impl fmt::Display for UploadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            RecognitionResult::Detected { plate, confidence } => {
                let tag = if self.known { " [KNOWN]" } else { "" };
                write!(
                    f,
                    "PLATE: {}{} | conf: {:.1}% | file: {}",
                    plate, tag, confidence, self.filename
                )
            }
            RecognitionResult::NotDetected => {
                write!(f, "NO PLATE DETECTED | file: {}", self.filename)
            }
        }
    }
}

/// Recognize, classify, notify, log: one pass per upload.
///
/// Holds only shared read-only collaborators, so any number of uploads can go
/// through the same handler at once.
pub struct UploadHandler {
    recognizer: Arc<dyn Recognizer>,
    registry: Arc<PlateRegistry>,
    dispatcher: Arc<WebhookDispatcher>,
}

impl UploadHandler {
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        registry: Arc<PlateRegistry>,
        dispatcher: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            recognizer,
            registry,
            dispatcher,
        }
    }

    /// Returns `None` for files that are not images.
    pub async fn process(&self, path: &Path, filename: &str) -> Option<UploadReport> {
        if !is_image(filename) {
            debug!("Ignoring non-image upload: {}", filename);
            return None;
        }

        let result = match self.recognizer.recognize(path).await {
            Ok(result) => result,
            Err(e) => {
                error!("Error processing {}: {}", filename, e);
                RecognitionResult::NotDetected
            }
        };

        let known = result
            .plate()
            .map(|plate| self.registry.is_known(plate))
            .unwrap_or(false);

        let webhook = self
            .dispatcher
            .maybe_dispatch(&result, filename, &self.registry)
            .await;

        let report = UploadReport {
            filename: filename.to_string(),
            result,
            known,
            webhook,
        };

        info!("{}", report);
        if let DispatchOutcome::Sent(delivery) = &report.webhook {
            if delivery.is_success() {
                info!("{}", delivery);
            } else {
                error!("{}", delivery);
            }
        }

        Some(report)
    }
}

#[async_trait]
impl UploadListener for UploadHandler {
    async fn on_file_received(&self, path: &Path, filename: &str) {
        self.process(path, filename).await;
    }
}

fn is_image(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
