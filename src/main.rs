mod config;
mod ftp;
mod handler;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::task::TaskTracker;
use tracing::info;

use notification::WebhookDispatcher;
use plate_recognizer::HttpAlprEngine;
use plate_registry::PlateRegistry;

use crate::config::{AppConfig, Settings};
use crate::ftp::{drain_uploads, FtpHost};
use crate::handler::UploadHandler;

struct App {
    config: AppConfig,
    handler: Arc<UploadHandler>,
    uploads: TaskTracker,
}

impl App {
    async fn new(config: AppConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.ftp.upload_dir).with_context(|| {
            format!(
                "failed to create upload directory {}",
                config.ftp.upload_dir.display()
            )
        })?;

        let registry = Arc::new(PlateRegistry::load(
            config.known_plates_file.as_deref(),
            config.known_plates.as_deref(),
        ));

        let recognizer = Arc::new(
            HttpAlprEngine::new(config.engine.clone()).context("failed to set up ALPR engine")?,
        );
        recognizer
            .check()
            .await
            .with_context(|| format!("ALPR engine unavailable at {}", config.engine.url))?;

        let dispatcher = Arc::new(
            WebhookDispatcher::new(config.webhook.clone()).context("failed to set up webhook")?,
        );

        log_startup(&config, &registry, &dispatcher);

        let handler = Arc::new(UploadHandler::new(recognizer, registry, dispatcher));
        Ok(Self {
            config,
            handler,
            uploads: TaskTracker::new(),
        })
    }

    async fn run(self) -> Result<()> {
        let host = FtpHost::new(self.config.ftp.clone(), self.handler, self.uploads.clone());
        info!("Ready to receive images...");

        let result = tokio::select! {
            result = host.serve() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                Ok(())
            }
        };

        drain_uploads(&self.uploads).await;
        result
    }
}

fn log_startup(config: &AppConfig, registry: &PlateRegistry, dispatcher: &WebhookDispatcher) {
    let (pasv_min, pasv_max) = config.ftp.passive_ports;
    info!("Passive ports: {}-{}", pasv_min, pasv_max);
    info!("Upload directory: {}", config.ftp.upload_dir.display());
    info!(
        "FTP credentials: {} / {}",
        config.ftp.user,
        "*".repeat(config.ftp.password.chars().count())
    );

    if dispatcher.is_enabled() {
        info!(
            "Webhook: {} {} (filter: {})",
            dispatcher.method(),
            dispatcher.display_url().unwrap_or_default(),
            dispatcher.filter()
        );
    } else {
        info!("Webhook: disabled");
    }

    if registry.is_empty() {
        info!("Known plates: none configured");
    } else {
        info!("Known plates: {} configured", registry.len());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    info!("Starting ALPR FTP server...");

    let settings = Settings::load()?;
    let config = AppConfig::try_from(settings)?;

    let app = App::new(config).await?;
    app.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(upload_dir: &std::path::Path, alpr_url: &str) -> AppConfig {
        let vars: HashMap<String, String> = [
            ("FTP_DIR", upload_dir.to_string_lossy().into_owned()),
            ("ALPR_URL", alpr_url.to_string()),
            ("ALPR_TIMEOUT_SECS", "2".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        AppConfig::try_from(Settings::from_map(vars).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_startup_fails_without_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), "http://127.0.0.1:9/v1/plate-reader/");

        let err = App::new(config).await.err().expect("startup should fail");
        assert!(format!("{:#}", err).contains("ALPR engine unavailable"));
    }

    #[tokio::test]
    async fn test_startup_with_live_engine() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/plate-reader/")
            .with_status(405)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        let config = config(&uploads, &format!("{}/v1/plate-reader/", server.url()));

        assert!(App::new(config).await.is_ok());
        assert!(uploads.is_dir());
        mock.assert_async().await;
    }
}
