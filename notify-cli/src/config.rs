use anyhow::{Context, Result, bail};
use notify_stream::{Identity, NotifyConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::Args;

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub token: Option<String>,
    pub profile: Option<String>,
    pub notify: NotifyConfig,
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("notiwatch").join("config.toml"))
    }

    /// Load the file (if any), then apply flag and environment overrides.
    pub fn load(args: &Args) -> Result<Self> {
        let path = args.config.clone().or_else(Self::default_path);
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) if args.config.is_some() => {
                bail!("configuration file {} does not exist", path.display())
            }
            _ => Self::default(),
        };

        if let Some(base_url) = &args.base_url {
            config.notify.base_url = base_url.clone();
        }
        if let Some(token) = &args.token {
            config.token = Some(token.clone());
        }
        if let Some(profile) = &args.profile {
            config.profile = Some(profile.clone());
        }

        config.notify.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn identity(&self) -> Result<Identity> {
        match (&self.profile, &self.token) {
            (Some(profile), Some(token)) => Ok(Identity::new(profile, token)),
            (None, _) => bail!("no profile configured (use --profile or NOTIWATCH_PROFILE)"),
            (_, None) => bail!("no token configured (use --token or NOTIWATCH_TOKEN)"),
        }
    }

    /// Effective configuration as TOML, with the token redacted.
    pub fn show(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.token.is_some() {
            shown.token = Some(REDACTED.to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            token = "secret"
            profile = "17"

            [notify]
            base_url = "https://example.com/api"
            refresh_debounce = 1500
            out_of_band_kinds = ["follow_request", "system"]

            [notify.reconnect]
            max_consecutive_server_errors = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.identity().unwrap().profile_id(), "17");
        assert_eq!(config.notify.refresh_debounce, Duration::from_millis(1500));
        assert_eq!(config.notify.out_of_band_kinds.len(), 2);
        assert_eq!(config.notify.reconnect.max_consecutive_server_errors, 3);
        assert_eq!(config.notify.reconnect.max_attempts, 10);
    }

    #[test]
    fn test_show_redacts_token() {
        let config = AppConfig {
            token: Some("secret".to_string()),
            profile: Some("17".to_string()),
            ..AppConfig::default()
        };
        let shown = config.show().unwrap();
        assert!(!shown.contains("secret"));
        assert!(shown.contains(REDACTED));
    }

    #[test]
    fn test_identity_requires_profile_and_token() {
        assert!(AppConfig::default().identity().is_err());
    }
}
