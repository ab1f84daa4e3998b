use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use libunftp::auth::{AuthenticationError, Authenticator, Credentials, DefaultUser};
use libunftp::notification::{DataEvent, DataListener, EventMeta};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use unftp_sbe_fs::ServerExt;

use crate::config::FtpConfig;
use crate::handler::UploadListener;

/// Accepts the single configured camera account.
#[derive(Debug)]
pub struct CameraAuthenticator {
    user: String,
    password: String,
}

impl CameraAuthenticator {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    fn check(&self, username: &str, password: Option<&str>) -> Result<(), AuthenticationError> {
        if username != self.user {
            return Err(AuthenticationError::BadUser);
        }
        match password {
            Some(password) if password == self.password => Ok(()),
            _ => Err(AuthenticationError::BadPassword),
        }
    }
}

#[async_trait]
impl Authenticator<DefaultUser> for CameraAuthenticator {
    async fn authenticate(
        &self,
        username: &str,
        creds: &Credentials,
    ) -> Result<DefaultUser, AuthenticationError> {
        match self.check(username, creds.password.as_deref()) {
            Ok(()) => Ok(DefaultUser {}),
            Err(e) => {
                warn!("Rejected FTP login for user '{}'", username);
                Err(e)
            }
        }
    }
}

/// Bridges the FTP server's data events to the upload pipeline.
///
/// Every completed `STOR` is handed off on its own task, so a slow
/// recognition or webhook never holds up other cameras. Tasks are tracked so
/// shutdown can wait for uploads that are still being processed.
pub struct UploadNotifier {
    root: PathBuf,
    listener: Arc<dyn UploadListener>,
    uploads: TaskTracker,
}

impl UploadNotifier {
    pub fn new(root: PathBuf, listener: Arc<dyn UploadListener>, uploads: TaskTracker) -> Self {
        Self {
            root,
            listener,
            uploads,
        }
    }
}

impl fmt::Debug for UploadNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadNotifier")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DataListener for UploadNotifier {
    async fn receive_data_event(&self, event: DataEvent, meta: EventMeta) {
        let DataEvent::Put { path, bytes } = event else {
            return;
        };
        let Some((absolute, filename)) = resolve_upload(&self.root, &path) else {
            warn!("Ignoring upload with unusable path: {}", path);
            return;
        };
        debug!(
            "Received {} ({} bytes) from {}",
            filename, bytes, meta.username
        );

        let listener = self.listener.clone();
        self.uploads.spawn(async move {
            listener.on_file_received(&absolute, &filename).await;
        });
    }
}

/// Map a server-side path (relative to the FTP root) to an absolute path and
/// its file name.
fn resolve_upload(root: &Path, ftp_path: &str) -> Option<(PathBuf, String)> {
    let relative = Path::new(ftp_path.trim_start_matches('/'));
    let filename = relative.file_name()?.to_str()?.to_string();
    Some((root.join(relative), filename))
}

/// Passive data ports `min..=max` as the half-open range the server expects.
/// `max` is below 65535, which config validation guarantees.
fn passive_range(min: u16, max: u16) -> Range<u16> {
    min..max + 1
}

/// Stop taking new upload tasks and wait for the ones still running.
pub async fn drain_uploads(uploads: &TaskTracker) {
    uploads.close();
    if !uploads.is_empty() {
        info!("Waiting for {} uploads in progress...", uploads.len());
    }
    uploads.wait().await;
}

pub struct FtpHost {
    config: FtpConfig,
    listener: Arc<dyn UploadListener>,
    uploads: TaskTracker,
}

impl FtpHost {
    pub fn new(config: FtpConfig, listener: Arc<dyn UploadListener>, uploads: TaskTracker) -> Self {
        Self {
            config,
            listener,
            uploads,
        }
    }

    /// Serve until the listener fails; binding errors are returned.
    pub async fn serve(self) -> Result<()> {
        let (pasv_min, pasv_max) = self.config.passive_ports;
        let notifier =
            UploadNotifier::new(self.config.upload_dir.clone(), self.listener, self.uploads);

        let server = libunftp::Server::with_fs(self.config.upload_dir.clone())
            .greeting("ALPR FTP server ready")
            .authenticator(Arc::new(CameraAuthenticator::new(
                &self.config.user,
                &self.config.password,
            )))
            .passive_ports(passive_range(pasv_min, pasv_max))
            .notify_data(notifier)
            .build()
            .context("failed to configure FTP server")?;

        let address = format!("0.0.0.0:{}", self.config.port);
        info!("FTP server starting on port {}", self.config.port);
        server
            .listen(address.clone())
            .await
            .with_context(|| format!("FTP server on {} stopped", address))
    }
}
