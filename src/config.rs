use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment};
use notification::{WebhookConfig, WebhookFilter, WebhookMethod};
use plate_recognizer::EngineConfig;
use serde::Deserialize;
use tracing::warn;

/// Raw settings as read from the environment (`FTP_USER` -> `ftp_user`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub ftp_user: String,
    pub ftp_pass: String,
    pub ftp_port: u16,
    pub pasv_min: u16,
    pub pasv_max: u16,
    pub ftp_dir: PathBuf,
    pub webhook_url: String,
    pub webhook_filter: String,
    pub webhook_method: String,
    pub webhook_timeout_secs: u64,
    pub known_plates_file: String,
    pub known_plates: String,
    pub alpr_url: String,
    pub alpr_token: String,
    pub alpr_timeout_secs: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::from_environment(Environment::default())
    }

    /// Load from an explicit key/value map instead of the process environment.
    #[cfg(test)]
    pub fn from_map(vars: std::collections::HashMap<String, String>) -> Result<Self> {
        Self::from_environment(Environment::default().source(Some(vars)))
    }

    fn from_environment(environment: Environment) -> Result<Self> {
        let settings = Config::builder()
            .set_default("ftp_user", "camera")?
            .set_default("ftp_pass", "camera123")?
            .set_default("ftp_port", 21)?
            .set_default("pasv_min", 21000)?
            .set_default("pasv_max", 21010)?
            .set_default("ftp_dir", "/ftp/uploads")?
            .set_default("webhook_url", "")?
            .set_default("webhook_filter", "all")?
            .set_default("webhook_method", "POST")?
            .set_default("webhook_timeout_secs", 5)?
            .set_default("known_plates_file", "")?
            .set_default("known_plates", "")?
            .set_default("alpr_url", "http://localhost:8080/v1/plate-reader/")?
            .set_default("alpr_token", "")?
            .set_default("alpr_timeout_secs", 10)?
            .add_source(environment)
            .build()
            .context("failed to read configuration")?;

        settings
            .try_deserialize()
            .context("invalid configuration")
    }
}

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub user: String,
    pub password: String,
    pub port: u16,
    pub passive_ports: (u16, u16),
    pub upload_dir: PathBuf,
}

/// Validated, immutable configuration handed to each component at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ftp: FtpConfig,
    pub webhook: WebhookConfig,
    pub engine: EngineConfig,
    pub known_plates_file: Option<PathBuf>,
    pub known_plates: Option<String>,
}

impl TryFrom<Settings> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(settings: Settings) -> Result<Self> {
        if settings.ftp_port == 0 {
            bail!("FTP_PORT must be between 1 and 65535");
        }
        if settings.pasv_min == 0 || settings.pasv_min > settings.pasv_max {
            bail!(
                "invalid passive port range {}-{}",
                settings.pasv_min,
                settings.pasv_max
            );
        }
        if settings.pasv_max == u16::MAX {
            bail!("PASV_MAX must be below {}", u16::MAX);
        }
        if settings.ftp_user.is_empty() {
            bail!("FTP_USER must not be empty");
        }

        let filter = settings
            .webhook_filter
            .parse::<WebhookFilter>()
            .unwrap_or_else(|_| {
                warn!(
                    "Invalid WEBHOOK_FILTER '{}', defaulting to 'all'",
                    settings.webhook_filter
                );
                WebhookFilter::All
            });

        Ok(Self {
            ftp: FtpConfig {
                user: settings.ftp_user,
                password: settings.ftp_pass,
                port: settings.ftp_port,
                passive_ports: (settings.pasv_min, settings.pasv_max),
                upload_dir: settings.ftp_dir,
            },
            webhook: WebhookConfig {
                url: non_empty(settings.webhook_url),
                filter,
                method: WebhookMethod::parse(&settings.webhook_method),
                timeout: Duration::from_secs(settings.webhook_timeout_secs),
            },
            engine: EngineConfig {
                url: settings.alpr_url,
                token: non_empty(settings.alpr_token),
                timeout: Duration::from_secs(settings.alpr_timeout_secs),
            },
            known_plates_file: non_empty(settings.known_plates_file).map(PathBuf::from),
            known_plates: non_empty(settings.known_plates),
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::try_from(Settings::from_map(HashMap::new()).unwrap()).unwrap();

        assert_eq!(config.ftp.user, "camera");
        assert_eq!(config.ftp.password, "camera123");
        assert_eq!(config.ftp.port, 21);
        assert_eq!(config.ftp.passive_ports, (21000, 21010));
        assert_eq!(config.ftp.upload_dir, PathBuf::from("/ftp/uploads"));
        assert_eq!(config.webhook.url, None);
        assert_eq!(config.webhook.filter, WebhookFilter::All);
        assert_eq!(config.webhook.method, WebhookMethod::Post);
        assert_eq!(config.webhook.timeout, Duration::from_secs(5));
        assert_eq!(config.known_plates_file, None);
        assert_eq!(config.known_plates, None);
    }

    #[test]
    fn test_reads_environment_keys() {
        let settings = Settings::from_map(vars(&[
            ("FTP_USER", "gate"),
            ("FTP_PASS", "12345"),
            ("FTP_PORT", "2121"),
            ("PASV_MIN", "30000"),
            ("PASV_MAX", "30009"),
            ("FTP_DIR", "/tmp/uploads"),
            ("WEBHOOK_URL", "http://relay.local/relay/0?turn=on"),
            ("WEBHOOK_FILTER", "KNOWN"),
            ("WEBHOOK_METHOD", "get"),
            ("KNOWN_PLATES", r#"{"ABC123": {}}"#),
        ]))
        .unwrap();
        let config = AppConfig::try_from(settings).unwrap();

        assert_eq!(config.ftp.user, "gate");
        assert_eq!(config.ftp.password, "12345");
        assert_eq!(config.ftp.port, 2121);
        assert_eq!(config.ftp.passive_ports, (30000, 30009));
        assert_eq!(
            config.webhook.url.as_deref(),
            Some("http://relay.local/relay/0?turn=on")
        );
        assert_eq!(config.webhook.filter, WebhookFilter::Known);
        assert_eq!(config.webhook.method, WebhookMethod::Get);
        assert_eq!(config.known_plates.as_deref(), Some(r#"{"ABC123": {}}"#));
    }

    #[test]
    fn test_password_is_kept_verbatim() {
        let settings = Settings::from_map(vars(&[("FTP_PASS", "007")])).unwrap();
        assert_eq!(settings.ftp_pass, "007");
    }

    #[test]
    fn test_invalid_filter_falls_back_to_all() {
        let settings = Settings::from_map(vars(&[("WEBHOOK_FILTER", "sometimes")])).unwrap();
        let config = AppConfig::try_from(settings).unwrap();
        assert_eq!(config.webhook.filter, WebhookFilter::All);
    }

    #[test]
    fn test_rejects_inverted_passive_range() {
        let settings =
            Settings::from_map(vars(&[("PASV_MIN", "21010"), ("PASV_MAX", "21000")])).unwrap();
        assert!(AppConfig::try_from(settings).is_err());
    }

    #[test]
    fn test_rejects_passive_max_at_port_limit() {
        let settings =
            Settings::from_map(vars(&[("PASV_MIN", "65000"), ("PASV_MAX", "65535")])).unwrap();
        assert!(AppConfig::try_from(settings).is_err());

        let settings =
            Settings::from_map(vars(&[("PASV_MIN", "65000"), ("PASV_MAX", "65534")])).unwrap();
        assert_eq!(
            AppConfig::try_from(settings).unwrap().ftp.passive_ports,
            (65000, 65534)
        );
    }

    #[test]
    fn test_rejects_non_numeric_port() {
        assert!(Settings::from_map(vars(&[("FTP_PORT", "twenty-one")])).is_err());
    }
}
