use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use percent_encoding::percent_decode_str;
use plate_recognizer::RecognitionResult;
use plate_registry::{Metadata, PlateRegistry};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("API request failed: {0}")]
    ApiError(String),
    #[error("{0}")]
    StatusError(reqwest::StatusCode),
}

/// Which detections trigger the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookFilter {
    #[default]
    All,
    Known,
    Unknown,
}

impl WebhookFilter {
    pub fn should_fire(self, known: bool) -> bool {
        match self {
            WebhookFilter::All => true,
            WebhookFilter::Known => known,
            WebhookFilter::Unknown => !known,
        }
    }
}

impl FromStr for WebhookFilter {
    type Err = NotificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(WebhookFilter::All),
            "known" => Ok(WebhookFilter::Known),
            "unknown" => Ok(WebhookFilter::Unknown),
            other => Err(NotificationError::ConfigError(format!(
                "invalid webhook filter '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for WebhookFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WebhookFilter::All => "all",
            WebhookFilter::Known => "known",
            WebhookFilter::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookMethod {
    /// Bare trigger for devices like relays: no body, no query added.
    Get,
    /// JSON [`WebhookEvent`] body.
    #[default]
    Post,
}

impl WebhookMethod {
    /// `GET` in any case selects GET; everything else is POST.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("GET") {
            WebhookMethod::Get
        } else {
            WebhookMethod::Post
        }
    }
}

impl fmt::Display for WebhookMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WebhookMethod::Get => "GET",
            WebhookMethod::Post => "POST",
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Empty or absent disables the webhook.
    pub url: Option<String>,
    pub filter: WebhookFilter,
    pub method: WebhookMethod,
    pub timeout: Duration,
}

/// JSON body of a POST webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub plate: String,
    pub confidence: f64,
    #[serde(with = "offset_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub known: bool,
    pub metadata: Metadata,
}

impl WebhookEvent {
    pub fn new(plate: &str, confidence: f64, filename: &str, metadata: Option<&Metadata>) -> Self {
        Self {
            plate: plate.to_string(),
            confidence,
            timestamp: Utc::now().trunc_subsecs(0),
            filename: filename.to_string(),
            known: metadata.is_some(),
            metadata: metadata.cloned().unwrap_or_default(),
        }
    }
}

/// RFC 3339 with an explicit `+00:00` offset and whole seconds.
mod offset_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Result of one webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub method: WebhookMethod,
    /// Target URL with credentials removed.
    pub url: String,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl Delivery {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WEBHOOK: {} {} -> ", self.method, self.url)?;
        match (&self.error, self.status) {
            (None, Some(status)) => write!(f, "{}", status),
            (None, None) => f.write_str("OK"),
            (Some(error), _) => write!(f, "ERROR {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Webhook disabled, nothing detected, or the filter did not match.
    Skipped,
    Sent(Delivery),
}

impl DispatchOutcome {
    pub fn fired(&self) -> bool {
        matches!(self, DispatchOutcome::Sent(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchOutcome::Sent(delivery) => delivery.status,
            DispatchOutcome::Skipped => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Sent(delivery) => delivery.error.as_deref(),
            DispatchOutcome::Skipped => None,
        }
    }
}

#[derive(Debug, Clone)]
struct WebhookTarget {
    url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl WebhookTarget {
    fn parse(raw: &str) -> Result<Self, NotificationError> {
        let mut url = Url::parse(raw)
            .map_err(|e| NotificationError::ConfigError(format!("invalid webhook URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NotificationError::ConfigError(format!(
                "unsupported webhook scheme '{}'",
                url.scheme()
            )));
        }

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(decode_userinfo);
        let password = url.password().map(decode_userinfo);
        if username.is_some() || password.is_some() {
            // http(s) URLs always accept userinfo changes.
            let _ = url.set_username("");
            let _ = url.set_password(None);
        }

        Ok(Self {
            url,
            username,
            password,
        })
    }
}

fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Decides whether a detection triggers the webhook and performs the call.
///
/// Failures are folded into the returned [`DispatchOutcome`]; nothing here
/// ever returns an error to the upload pipeline.
pub struct WebhookDispatcher {
    client: Client,
    target: Option<WebhookTarget>,
    filter: WebhookFilter,
    method: WebhookMethod,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Result<Self, NotificationError> {
        let target = match config.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Some(WebhookTarget::parse(url)?),
            _ => None,
        };

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NotificationError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            target,
            filter: config.filter,
            method: config.method,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Webhook URL as it appears in log lines, without credentials.
    pub fn display_url(&self) -> Option<String> {
        self.target.as_ref().map(|t| t.url.to_string())
    }

    pub fn filter(&self) -> WebhookFilter {
        self.filter
    }

    pub fn method(&self) -> WebhookMethod {
        self.method
    }

    pub async fn maybe_dispatch(
        &self,
        result: &RecognitionResult,
        filename: &str,
        registry: &PlateRegistry,
    ) -> DispatchOutcome {
        let Some(target) = &self.target else {
            return DispatchOutcome::Skipped;
        };
        let RecognitionResult::Detected { plate, confidence } = result else {
            return DispatchOutcome::Skipped;
        };

        let metadata = registry.lookup(plate);
        if !self.filter.should_fire(metadata.is_some()) {
            debug!("Webhook filter '{}' skips plate {}", self.filter, plate);
            return DispatchOutcome::Skipped;
        }

        let event = WebhookEvent::new(plate, *confidence, filename, metadata);
        DispatchOutcome::Sent(self.send(target, &event).await)
    }

    async fn send(&self, target: &WebhookTarget, event: &WebhookEvent) -> Delivery {
        let mut request = match self.method {
            WebhookMethod::Get => self.client.get(target.url.clone()),
            WebhookMethod::Post => self.client.post(target.url.clone()).json(event),
        };
        if let Some(username) = &target.username {
            request = request.basic_auth(username, target.password.as_ref());
        } else if let Some(password) = &target.password {
            request = request.basic_auth("", Some(password));
        }

        let result = match request.send().await {
            Ok(response) if response.status().is_success() => Ok(response.status()),
            Ok(response) => Err(NotificationError::StatusError(response.status())),
            Err(e) => Err(NotificationError::ApiError(e.to_string())),
        };

        let (status, error) = match result {
            Ok(status) => (Some(status.as_u16()), None),
            Err(NotificationError::StatusError(status)) => {
                (Some(status.as_u16()), Some(status.to_string()))
            }
            Err(e) => (None, Some(e.to_string())),
        };

        Delivery {
            method: self.method,
            url: target.url.to_string(),
            status,
            error,
        }
    }
}

/// Render a timestamp the way it appears in webhook payloads.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, false)
}
