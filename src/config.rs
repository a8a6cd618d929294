//! Configuration management for the IVR replay tester

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub run: RunConfig,
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub replay: ReplayOptions,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Numbers and endpoints used when a template is replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// System under test
    pub destination: Ipv4Addr,
    /// Address advertised in Via/Contact/SDP
    pub source: Ipv4Addr,
    pub called_prefix: String,
    pub called: String,
    pub called_count: u32,
    pub calling: String,
    /// Empty when calls are not diverted
    pub redirect: String,
    pub redirect_count: u32,
    pub reason: String,
    pub stress_test: bool,
    pub channel_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub local_port: u16,
    pub remote_port: u16,
    /// UDP ports treated as signaling when reading a trace
    pub capture_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayOptions {
    /// Hide the caller behind P-Asserted-Identity / Privacy: id
    pub privacy: bool,
    pub display_name: DisplayNamePolicy,
    pub media_start_delay_ms: u64,
    pub rest_interval_ms: u64,
    pub start_stagger_ms: u64,
    /// Draw unpassed call flows on screen, never in stress mode
    pub draw_call_flow: bool,
    pub force_parse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "name")]
pub enum DisplayNamePolicy {
    #[serde(rename = "caller")]
    Caller,
    #[serde(rename = "override")]
    Override(String),
    #[serde(rename = "clear")]
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub case_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub fuzzy_prompts: Option<PathBuf>,
    pub prompt_book: Option<PathBuf>,
    pub result_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            local_port: 5060,
            remote_port: 5060,
            capture_ports: vec![5060, 5061],
        }
    }
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            privacy: false,
            display_name: DisplayNamePolicy::Caller,
            media_start_delay_ms: 0,
            rest_interval_ms: 1000,
            start_stagger_ms: 500,
            draw_call_flow: true,
            force_parse: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            case_dir: PathBuf::from("case"),
            cache_dir: PathBuf::from("cache"),
            fuzzy_prompts: None,
            prompt_book: None,
            result_dir: PathBuf::from("result"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Compact,
        }
    }
}

impl ReplayConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ReplayConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default_config())?;

        // IVR_REPLAY_RUN__DESTINATION=10.0.0.2 and so on
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::Environment::with_prefix("IVR_REPLAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let replay_config = settings.try_deserialize()?;
        Ok(replay_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.channel_count == 0 {
            return Err(Error::parse("Channel count must be at least 1"));
        }

        if self.run.destination.is_unspecified() {
            return Err(Error::parse("Destination address is not set"));
        }

        if self.run.called_count > 1 && self.run.called.parse::<u64>().is_err() {
            return Err(Error::parse(
                "Called number must be numeric when called count is greater than 1",
            ));
        }

        if self.run.redirect_count > 1 && self.run.redirect.parse::<u64>().is_err() {
            return Err(Error::parse(
                "Redirect number must be numeric when redirect count is greater than 1",
            ));
        }

        if let DisplayNamePolicy::Override(name) = &self.replay.display_name {
            if name.contains('"') {
                return Err(Error::parse("Display name must not contain quotes"));
            }
        }

        if self.sip.capture_ports.is_empty() {
            return Err(Error::parse("No signaling ports configured for trace reading"));
        }

        Ok(())
    }

    /// Whether channels rotate through called numbers.
    pub fn rotates_called(&self) -> bool {
        self.run.called_count > 1
    }

    pub fn default_config() -> Self {
        Self {
            run: RunConfig {
                destination: Ipv4Addr::new(127, 0, 0, 1),
                source: Ipv4Addr::new(127, 0, 0, 1),
                called_prefix: String::new(),
                called: "800".to_string(),
                called_count: 1,
                calling: "anonymous".to_string(),
                redirect: String::new(),
                redirect_count: 0,
                reason: "unknown".to_string(),
                stress_test: false,
                channel_count: 1,
            },
            sip: SipConfig::default(),
            replay: ReplayOptions::default(),
            paths: PathsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReplayConfig::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.sip.capture_ports, vec![5060, 5061]);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = ReplayConfig::default_config();
        config.replay.display_name = DisplayNamePolicy::Override("Alice".to_string());
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ReplayConfig = toml::from_str(&text).unwrap();
        assert_eq!(
            parsed.replay.display_name,
            DisplayNamePolicy::Override("Alice".to_string())
        );
        assert_eq!(parsed.run.destination, config.run.destination);
    }

    #[test]
    fn test_minimal_file_uses_section_defaults() {
        let text = r#"
            [run]
            destination = "10.1.1.2"
            source = "10.1.1.1"
            called_prefix = ""
            called = "0100"
            called_count = 10
            calling = "5551000"
            redirect = ""
            redirect_count = 0
            reason = "unknown"
            stress_test = true
            channel_count = 3
        "#;
        let config: ReplayConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.rotates_called());
        assert_eq!(config.sip.local_port, 5060);
        assert_eq!(config.replay.start_stagger_ms, 500);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ReplayConfig::default_config();
        config.run.channel_count = 0;
        assert!(config.validate().is_err());

        let mut config = ReplayConfig::default_config();
        config.run.called = "sales".to_string();
        config.run.called_count = 4;
        assert!(config.validate().is_err());

        let mut config = ReplayConfig::default_config();
        config.run.destination = Ipv4Addr::UNSPECIFIED;
        assert!(config.validate().is_err());
    }
}
