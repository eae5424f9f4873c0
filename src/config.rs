//! Configuration loading: a TOML file followed by environment overrides.
//!
//! `name`, `smartthings.token` and, for a single routine, `smartthings.routine_id`
//! are required. Everything else has a default.

use std::net::SocketAddr;

use serde::Deserialize;
use surf::Url;

use crate::{integrations::smartthings, request_sync, Credential, Error, Publish, RoutineRef};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Label shown in the home app (and the room hint for bridged devices).
    pub name: Option<String>,
    pub smartthings: SmartThingsConfig,
    pub publish: PublishConfig,
    pub server: ServerConfig,
    pub linking: LinkingConfig,
    /// Notifications to the host's home graph; off when absent.
    pub home_graph: Option<HomeGraphConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Publish the one configured routine.
    Single,
    /// Publish every scene whose icon matches.
    Discovery,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SmartThingsConfig {
    pub token: Option<Credential>,
    pub base_url: String,
    pub mode: Mode,
    pub routine_id: Option<String>,
    pub icon: String,
    /// Seconds between discovery cycles; `0` discovers once.
    pub refresh_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub strategy: Publish,
    /// Give each television a single placeholder input.
    pub input_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LinkingConfig {
    pub client_id: String,
    pub client_secret: Credential,
    pub agent_user_id: String,
    /// Key for the operator API (`/api/{key}`).
    pub api_key: Credential,
}

#[derive(Debug, Deserialize)]
pub struct HomeGraphConfig {
    pub token: Credential,
    #[serde(default = "default_home_graph_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

fn default_home_graph_url() -> String {
    request_sync::DEFAULT_BASE_URL.to_owned()
}

impl Config {
    /// Reads `path`, applies environment overrides and validates the result.
    /// No network activity happens before validation succeeds.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("ROUTINES_TOKEN") {
            self.smartthings.token = Some(Credential::new(val));
        }
        if let Ok(val) = std::env::var("ROUTINES_BIND") {
            self.apply_bind(&val)?;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
        Ok(())
    }

    /// Applies a `host:port` override, all or nothing.
    fn apply_bind(&mut self, bind: &str) -> Result<(), ConfigError> {
        let invalid =
            || ConfigError::Validation(format!("ROUTINES_BIND `{}` is not host:port", bind));
        let (host, port) = bind.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        self.server.host = host.to_string();
        self.server.port = port;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.name()?;
        self.credential()?;
        if self.smartthings.mode == Mode::Single {
            self.routine()?;
        }
        self.base_url()?;
        if let Some(home_graph) = &self.home_graph {
            parse_url(&home_graph.base_url)?;
        }
        self.bind_addr()?;
        if self.server.port == 0 {
            return Err(ConfigError::Validation("port must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn name(&self) -> Result<&str, Error> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(Error::ConfigMissing("name"))
    }

    pub fn credential(&self) -> Result<Credential, Error> {
        self.smartthings
            .token
            .clone()
            .filter(|token| !token.is_blank())
            .ok_or(Error::ConfigMissing("token"))
    }

    /// The single configured routine, labelled with `name`.
    pub fn routine(&self) -> Result<RoutineRef, Error> {
        let id = self
            .smartthings
            .routine_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(Error::ConfigMissing("routine_id"))?;
        Ok(RoutineRef::with_name(id, self.name()?))
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        parse_url(&self.smartthings.base_url)
    }

    pub fn home_graph_url(&self) -> Option<Result<Url, ConfigError>> {
        self.home_graph
            .as_ref()
            .map(|home_graph| parse_url(&home_graph.base_url))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|_| {
                ConfigError::Validation(format!(
                    "`{}:{}` is not a socket address",
                    self.server.host, self.server.port
                ))
            })
    }
}

// Relative joins drop the last path segment unless the base ends in `/`.
fn parse_url(url: &str) -> Result<Url, ConfigError> {
    let url = if url.ends_with('/') {
        url.to_owned()
    } else {
        format!("{}/", url)
    };
    Url::parse(&url).map_err(|e| ConfigError::Validation(format!("bad url `{}`: {}", url, e)))
}

impl Default for SmartThingsConfig {
    fn default() -> Self {
        SmartThingsConfig {
            token: None,
            base_url: smartthings::DEFAULT_BASE_URL.to_owned(),
            mode: Mode::Single,
            routine_id: None,
            icon: "204".to_owned(),
            refresh_secs: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for LinkingConfig {
    fn default() -> Self {
        LinkingConfig {
            client_id: "routines".to_owned(),
            client_secret: Credential::new(uuid::Uuid::new_v4().to_string()),
            agent_user_id: "routines".to_owned(),
            api_key: Credential::new(uuid::Uuid::new_v4().to_string()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "routines=info,warp=warn".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Missing(#[from] Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}
