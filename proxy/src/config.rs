use http::{HeaderMap, HeaderName, HeaderValue};
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashSet;
use streamer::{Protocol, SourceCandidate, SourceSpec, StreamerConfig};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Empty channel id")]
    EmptyChannelId,

    #[error("Invalid channel id: {0:?}")]
    InvalidChannelId(String),

    #[error("Duplicate channel id: {0}")]
    DuplicateChannel(String),

    #[error("Channel {0} has no sources")]
    NoSources(String),

    #[error("Channel {channel} has an invalid source header: {header}")]
    InvalidHeader { channel: String, header: String },

    #[error("Empty token salt")]
    EmptyTokenSalt,

    #[error("Invalid user name: {0:?}")]
    InvalidUser(String),
}

/// Relay configuration, minus the process level logging and metrics sections.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener serving playlists and streams
    pub listener: Listener,
    /// Listener serving health, readiness and status
    pub admin_listener: Listener,
    /// Public address used in playlist entries. Derived from the request
    /// when absent.
    pub base_url: Option<Url>,
    pub access: AccessConfig,
    #[serde(default)]
    pub streamer: StreamerConfig,
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.access.validate()?;

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if channel.id.is_empty() {
                return Err(ValidationError::EmptyChannelId);
            }
            if !channel.id.chars().all(is_url_safe) {
                return Err(ValidationError::InvalidChannelId(channel.id.clone()));
            }
            if !ids.insert(&channel.id) {
                return Err(ValidationError::DuplicateChannel(channel.id.clone()));
            }
            channel.source_spec()?;
        }

        Ok(())
    }
}

/// Characters that appear verbatim in playlist URLs.
fn is_url_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~' | '-')
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AccessConfig {
    /// Secret mixed into every stream token
    pub token_salt: String,
    /// Hand out playlists to callers that do not name a known user
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub users: Vec<String>,
}

impl AccessConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.token_salt.is_empty() {
            return Err(ValidationError::EmptyTokenSalt);
        }
        // The token separates user and signature with the first '-'.
        for user in &self.users {
            if user.is_empty() || user.contains('-') || !user.chars().all(is_url_safe) {
                return Err(ValidationError::InvalidUser(user.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
    pub logo: Option<String>,
    pub group: Option<String>,
    /// Concurrent client limit, 0 means unlimited
    #[serde(default)]
    pub max_connections: u32,
    /// Candidate sources, most preferred first
    pub sources: Vec<SourceConfig>,
}

impl ChannelConfig {
    pub fn source_spec(&self) -> Result<SourceSpec, ValidationError> {
        if self.sources.is_empty() {
            return Err(ValidationError::NoSources(self.id.clone()));
        }

        let candidates = self
            .sources
            .iter()
            .map(|source| source.to_candidate(&self.id))
            .collect::<Result<_, _>>()?;

        Ok(SourceSpec::new(candidates))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub url: Url,
    #[serde(default)]
    pub protocol: Protocol,
    /// Request headers sent to this source, in the given order
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

impl SourceConfig {
    fn to_candidate(&self, channel: &str) -> Result<SourceCandidate, ValidationError> {
        let invalid = |header: &str| ValidationError::InvalidHeader {
            channel: channel.to_string(),
            header: header.to_string(),
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid(name.as_str()))?;
            headers.append(name, value);
        }

        let mut candidate = SourceCandidate::new(self.url.clone()).with_protocol(self.protocol);
        candidate.headers = headers;
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
listener:
    host: "0.0.0.0"
    port: 8080
admin_listener:
    host: "127.0.0.1"
    port: 8081
base_url: "http://tv.example.com"
access:
    token_salt: "pepper"
    users:
        - alice
streamer:
    idle_grace_secs: 10
channels:
    - id: news
      name: News
      group: Info
      max_connections: 2
      sources:
        - url: "http://a.example.com/news.ts"
        - url: "http://b.example.com/news.m3u8"
          protocol: hls
          headers:
            Authorization: "Bearer x"
"#;

    #[test]
    fn test_parse_valid_config() {
        let config: Config = serde_yaml::from_str(CONFIG).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.streamer.idle_grace_secs, 10);
        assert_eq!(config.streamer.connect_timeout_secs, 5);
        assert!(!config.access.allow_anonymous);

        let spec = config.channels[0].source_spec().unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(spec.candidates[0].protocol, Protocol::Ts);
        assert_eq!(spec.candidates[1].protocol, Protocol::Hls);
        assert_eq!(
            spec.candidates[1].headers.get("authorization").unwrap(),
            "Bearer x"
        );
    }

    #[test]
    fn test_validation_errors() {
        let config: Config = serde_yaml::from_str(CONFIG).unwrap();

        let mut bad = config.clone();
        bad.admin_listener.port = 0;
        assert_eq!(bad.validate(), Err(ValidationError::InvalidPort));

        let mut bad = config.clone();
        bad.channels.push(bad.channels[0].clone());
        assert_eq!(
            bad.validate(),
            Err(ValidationError::DuplicateChannel("news".into()))
        );

        let mut bad = config.clone();
        bad.channels[0].sources.clear();
        assert_eq!(bad.validate(), Err(ValidationError::NoSources("news".into())));

        let mut bad = config.clone();
        bad.channels[0].sources[0]
            .headers
            .insert("bad header".into(), "x".into());
        assert!(matches!(
            bad.validate(),
            Err(ValidationError::InvalidHeader { .. })
        ));

        let mut bad = config.clone();
        bad.access.users.push("bob-smith".into());
        assert_eq!(
            bad.validate(),
            Err(ValidationError::InvalidUser("bob-smith".into()))
        );

        let mut bad = config.clone();
        bad.access.users.push("bob smith".into());
        assert_eq!(
            bad.validate(),
            Err(ValidationError::InvalidUser("bob smith".into()))
        );

        let mut bad = config;
        bad.access.token_salt.clear();
        assert_eq!(bad.validate(), Err(ValidationError::EmptyTokenSalt));
    }

    #[test]
    fn test_channel_ids_must_be_url_safe() {
        let config: Config = serde_yaml::from_str(CONFIG).unwrap();

        for id in ["sport/hd", "news?x", "a#b", "news hd", "kanäle"] {
            let mut bad = config.clone();
            bad.channels[0].id = id.into();
            assert_eq!(
                bad.validate(),
                Err(ValidationError::InvalidChannelId(id.into()))
            );
        }

        let mut good = config;
        good.channels[0].id = "sport-hd.1_~".into();
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_invalid_url_is_rejected_on_parse() {
        let yaml = CONFIG.replace("http://a.example.com/news.ts", "not a url");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }
}
