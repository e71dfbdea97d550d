//! Client configuration.

use config::{Config, Environment, File};
use serde::Deserialize;
use url::Url;

use crate::error::Result;

/// Environment variable prefix, e.g. `AGENT_CONSOLE__API_BASE_URL`.
pub const ENV_PREFIX: &str = "AGENT_CONSOLE";

/// How concurrent 401s share a credential refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Concurrent callers await one in-flight refresh.
    #[default]
    SingleFlight,
    /// A flag suppresses nested refreshes; callers that find it set keep
    /// their 401.
    Guarded,
}

/// Settings for the second (execution) backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentOsConfig {
    pub base_url: String,
    /// Bearer key sent to the backend; absent keys surface as
    /// `MissingSecurityKey` on 401.
    pub security_key: Option<String>,
    pub config_path: String,
    pub health_path: String,
    /// Path template for a session's runs; `{session_id}` is substituted.
    pub session_runs_path: String,
}

impl AgentOsConfig {
    /// Parsed backend base URL.
    ///
    /// # Errors
    /// Returns error if `base_url` is not an absolute URL.
    pub fn base(&self) -> Result<Url> {
        Ok(Url::parse(&self.base_url)?)
    }
}

impl Default for AgentOsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7777".to_string(),
            security_key: None,
            config_path: "/config".to_string(),
            health_path: "/health".to_string(),
            session_runs_path: "/sessions/{session_id}/runs".to_string(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub refresh_path: String,
    /// URL path prefixes of the auth domain. 401s there never refresh.
    pub auth_path_prefixes: Vec<String>,
    /// Routes where an unauthenticated response is expected (exact match).
    pub public_routes: Vec<String>,
    /// Auth routes (prefix match), also excluded from refresh.
    pub auth_routes: Vec<String>,
    pub sign_in_route: String,
    pub refresh_mode: RefreshMode,
    pub request_timeout_secs: u64,
    pub agent_os: AgentOsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            refresh_path: "/api/auth/refresh".to_string(),
            auth_path_prefixes: vec!["/api/auth".to_string()],
            public_routes: vec!["/".to_string(), "/pricing".to_string()],
            auth_routes: vec![
                "/sign-in".to_string(),
                "/sign-up".to_string(),
                "/forgot-password".to_string(),
            ],
            sign_in_route: "/sign-in".to_string(),
            refresh_mode: RefreshMode::default(),
            request_timeout_secs: 30,
            agent_os: AgentOsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration: defaults, then an optional file, then
    /// `AGENT_CONSOLE__*` environment variables.
    ///
    /// # Errors
    /// Returns error if a source cannot be read or does not deserialize.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("auth_path_prefixes")
                .with_list_parse_key("public_routes")
                .with_list_parse_key("auth_routes")
                .try_parsing(true),
        );
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Parsed API base URL.
    ///
    /// # Errors
    /// Returns error if `api_base_url` is not an absolute URL.
    pub fn api_base(&self) -> Result<Url> {
        Ok(Url::parse(&self.api_base_url)?)
    }

    /// Absolute URL of the refresh endpoint.
    ///
    /// # Errors
    /// Returns error if the base URL or the refresh path does not parse.
    pub fn refresh_url(&self) -> Result<Url> {
        join_url(&self.api_base()?, &self.refresh_path)
    }

    /// Absolute URL of a path on the execution backend.
    ///
    /// # Errors
    /// Returns error if the backend base URL or `path` does not parse.
    pub fn agent_os_url(&self, path: &str) -> Result<Url> {
        join_url(&self.agent_os.base()?, path)
    }
}

/// Resolve `path` under `base`, keeping any path prefix the base carries
/// (`http://h/api` + `/x` is `http://h/api/x`).
///
/// # Errors
/// Returns error if `path` cannot be resolved against `base`.
pub fn join_url(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    Ok(base.join(path.trim_start_matches('/'))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.refresh_mode, RefreshMode::SingleFlight);
        assert_eq!(
            cfg.refresh_url().unwrap().as_str(),
            "http://localhost:3000/api/auth/refresh"
        );
        assert_eq!(
            cfg.agent_os_url("/config").unwrap().as_str(),
            "http://localhost:7777/config"
        );
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let cfg: ClientConfig = Config::builder()
            .add_source(config::File::from_str(
                r#"{"api_base_url": "https://app.example.com/", "refresh_mode": "guarded"}"#,
                config::FileFormat::Json,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.refresh_mode, RefreshMode::Guarded);
        assert_eq!(
            cfg.refresh_url().unwrap().as_str(),
            "https://app.example.com/api/auth/refresh"
        );
        assert_eq!(cfg.sign_in_route, "/sign-in");
    }

    #[test]
    fn test_join_url() {
        let join = |base: &str, path: &str| {
            join_url(&Url::parse(base).unwrap(), path)
                .unwrap()
                .to_string()
        };
        assert_eq!(join("http://h/", "/x"), "http://h/x");
        assert_eq!(join("http://h", "x"), "http://h/x");
        assert_eq!(join("http://h/agno", "/config"), "http://h/agno/config");
        assert_eq!(join("http://h/agno/?k=v", "health"), "http://h/agno/health");
    }

    #[test]
    fn test_malformed_base_url_is_rejected() {
        let cfg = ClientConfig {
            api_base_url: "not a url".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            cfg.refresh_url(),
            Err(crate::error::TransportError::InvalidUrl(_))
        ));
    }
}
