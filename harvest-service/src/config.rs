use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};
use time::{macros::format_description, Date, UtcOffset};

use crate::{
    auth::BackoffPolicy,
    pipeline::{PipelineSettings, RunMode},
    portal::{Credentials, PortalSettings},
    sinks::ExportFormat,
};

pub const DEFAULT_CONFIG_PATH: &str = "harvest-config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub username: Option<String>,
    /// Only ever read from `HARVEST_PASSWORD`.
    #[serde(skip)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".harvest_session.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 2000,
            backoff_cap_ms: 10_000,
            call_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("usage.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub mode: RunMode,
    pub hourly_target_date: Option<String>,
    pub interval_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Hourly,
            hourly_target_date: None,
            interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub base_url: String,
    pub login_path: String,
    pub member_path: String,
    pub daily_path: String,
    pub hourly_path: String,
    pub utc_offset_hours: i8,
    pub user_agent: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        let defaults = PortalSettings::default();
        Self {
            base_url: defaults.base_url,
            login_path: defaults.login_path,
            member_path: defaults.member_path,
            daily_path: defaults.daily_path,
            hourly_path: defaults.hourly_path,
            utc_offset_hours: 9,
            user_agent: defaults.user_agent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub webhook_url: Option<String>,
    pub channel_capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            channel_capacity: 32,
            max_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub account: AccountConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub run: RunConfig,
    pub portal: PortalConfig,
    pub alerts: AlertsConfig,
    pub export: Option<ExportConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    /// Load from `$HARVEST_CONFIG` (default `harvest-config.toml`), then apply
    /// environment overrides. A missing default file yields the defaults.
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let explicit = env::var("HARVEST_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut cfg = match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(e) if explicit.is_none() && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path, "no config file found, using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("failed to read config {path}: {e}")),
        };

        cfg.apply_env(|key| env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(username) = lookup("HARVEST_USERNAME") {
            self.account.username = Some(username);
        }
        if let Some(password) = lookup("HARVEST_PASSWORD") {
            self.account.password = Some(password);
        }
        if let Some(mode) = lookup("HARVEST_MODE") {
            match mode.parse() {
                Ok(mode) => self.run.mode = mode,
                Err(e) => tracing::warn!(error = %e, "ignoring HARVEST_MODE"),
            }
        }
        if let Some(date) = lookup("HARVEST_HOURLY_DATE") {
            self.run.hourly_target_date = Some(date);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.hourly_target_date()?;
        self.utc_offset()?;
        if self.alerts.channel_capacity == 0 {
            anyhow::bail!("alerts.channel_capacity must be positive");
        }
        if matches!(self.run.interval_secs, Some(0)) {
            anyhow::bail!("run.interval_secs must be positive");
        }
        Ok(())
    }

    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        let username = self
            .account
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("no username: set account.username or HARVEST_USERNAME"))?;
        let password = self
            .account
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow::anyhow!("no password: set HARVEST_PASSWORD"))?;
        Ok(Credentials::new(username, password))
    }

    pub fn hourly_target_date(&self) -> anyhow::Result<Option<Date>> {
        let Some(raw) = self.run.hourly_target_date.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        Date::parse(raw, format_description!("[year]-[month]-[day]"))
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid hourly target date '{raw}' (expected YYYY-MM-DD): {e}"))
    }

    pub fn utc_offset(&self) -> anyhow::Result<UtcOffset> {
        UtcOffset::from_hms(self.portal.utc_offset_hours, 0, 0)
            .map_err(|e| anyhow::anyhow!("invalid portal.utc_offset_hours: {e}"))
    }

    pub fn portal_settings(&self) -> PortalSettings {
        PortalSettings {
            base_url: self.portal.base_url.clone(),
            login_path: self.portal.login_path.clone(),
            member_path: self.portal.member_path.clone(),
            daily_path: self.portal.daily_path.clone(),
            hourly_path: self.portal.hourly_path.clone(),
            user_agent: self.portal.user_agent.clone(),
            request_timeout: Duration::from_secs(self.auth.call_timeout_secs),
        }
    }

    pub fn pipeline_settings(&self) -> anyhow::Result<PipelineSettings> {
        Ok(PipelineSettings {
            mode: self.run.mode,
            max_retries: self.auth.max_retries,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.auth.backoff_base_ms),
                Duration::from_millis(self.auth.backoff_cap_ms),
            ),
            call_timeout: Duration::from_secs(self.auth.call_timeout_secs),
            hourly_target_date: self.hourly_target_date()?,
            utc_offset: self.utc_offset()?,
        })
    }
}
