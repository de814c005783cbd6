use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api")]
    pub api_url: String,

    #[serde(default = "default_relay")]
    pub relay_url: String,

    #[serde(default = "default_call_screen")]
    pub call_screen_url: String,

    /// Sent as the `Cookie` header on API and relay requests.
    #[serde(default)]
    pub session_cookie: Option<String>,

    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,

    /// Messages kept per friend.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub call: CallConfig,

    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Discovery server speaking the PeerJS signaling protocol.
    pub url: String,
    pub key: String,
    pub ice_servers: Vec<IceServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ring_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub unreachable_timeout_secs: u64,
    pub answer_timeout_secs: u64,
    pub dial_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: String,
    pub audio: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            url: "wss://0.peerjs.com:443/".to_string(),
            key: "peerjs".to_string(),
            ice_servers: vec![
                IceServerConfig {
                    urls: vec!["stun:stun.l.google.com:19302".to_string()],
                    username: String::new(),
                    credential: String::new(),
                },
                IceServerConfig {
                    urls: vec!["stun:global.stun.twilio.com:3478".to_string()],
                    username: String::new(),
                    credential: String::new(),
                },
            ],
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 45,
            connect_timeout_secs: 30,
            unreachable_timeout_secs: 15,
            answer_timeout_secs: 10,
            dial_grace_ms: 1500,
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn unreachable_timeout(&self) -> Duration {
        Duration::from_secs(self.unreachable_timeout_secs)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }

    pub fn dial_grace(&self) -> Duration {
        Duration::from_millis(self.dial_grace_ms)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            facing_mode: "user".to_string(),
            audio: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.peer.ice_servers.len() < 2 {
            return Err(anyhow!(
                "at least two ICE servers are required, found {}",
                self.peer.ice_servers.len()
            ));
        }
        if self.history_limit == 0 {
            return Err(anyhow!("history_limit must be positive"));
        }
        url::Url::parse(&self.relay_url).context("invalid relay_url")?;
        url::Url::parse(&self.api_url).context("invalid api_url")?;
        url::Url::parse(&self.peer.url).context("invalid peer.url")?;
        Ok(())
    }
}

/// `config.toml` in the platform configuration directory, falling back to
/// the working directory.
pub fn default_path() -> PathBuf {
    ProjectDirs::from("app", "talksphere", "TalkSphere")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

pub fn load(path: &Path) -> Result<Config> {
    // create a new file if it does not exist
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        let config = toml::from_str::<Config>("")?;
        info!("config {:#?}", config);
        file.write_all(toml::to_string(&config)?.as_ref())?;
        return Ok(config);
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn default_api() -> String {
    "http://localhost:4000".to_string()
}

fn default_relay() -> String {
    "http://localhost:4000".to_string()
}

fn default_call_screen() -> String {
    "http://localhost:5173/callscreen".to_string()
}

fn default_reconnection_attempts() -> u32 {
    5
}

fn default_history_limit() -> usize {
    200
}
