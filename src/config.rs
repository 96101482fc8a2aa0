use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use thiserror::Error;

pub const DEFAULT_KEY_REPEAT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_KEY_REPEAT_DELAY_MS: u64 = 50;
pub const DEFAULT_MAX_EVENTS_PER_SECOND: u32 = 90;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ConfigToml {
    pub key_repeat: Option<KeyRepeatToml>,
    pub dispatch: Option<DispatchToml>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct KeyRepeatToml {
    pub enabled: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub delay_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DispatchToml {
    pub channel_capacity: Option<usize>,
    pub max_events_per_second: Option<u32>,
}

impl ConfigToml {
    pub fn new(path: &PathBuf) -> Result<ConfigToml, ConfigError> {
        let config = fs::read_to_string(path)?;
        log::info!("using config: \"{}\"", path.display());
        Ok(toml::from_str::<_>(&config)?)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// non-default config file location
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// override the key repeat timeout (milliseconds)
    #[arg(long)]
    key_repeat_timeout_ms: Option<u64>,

    /// override the key repeat delay (milliseconds)
    #[arg(long)]
    key_repeat_delay_ms: Option<u64>,

    /// disable synthetic key repeats entirely
    #[arg(long)]
    no_key_repeat: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub key_repeat_enabled: bool,
    pub key_repeat_timeout: Duration,
    pub key_repeat_delay: Duration,
    pub channel_capacity: usize,
    pub max_events_per_second: u32,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        let args = CliArgs::parse();

        let config_path = args.config.unwrap_or_else(|| {
            let xdg_config_home = env::var("XDG_CONFIG_HOME").unwrap_or_else(|_| {
                format!("{}/.config", env::var("HOME").unwrap_or_default())
            });
            PathBuf::from(format!("{xdg_config_home}/input-dispatch/config.toml"))
        });

        let config_toml = match ConfigToml::new(&config_path) {
            Err(e) => {
                log::warn!("{}: {e}", config_path.display());
                log::warn!("continuing without config file ...");
                None
            }
            Ok(c) => Some(c),
        };

        let key_repeat = config_toml.as_ref().and_then(|c| c.key_repeat.as_ref());
        let dispatch = config_toml.as_ref().and_then(|c| c.dispatch.as_ref());

        let key_repeat_enabled =
            !args.no_key_repeat && key_repeat.and_then(|k| k.enabled).unwrap_or(true);
        let key_repeat_timeout_ms = args
            .key_repeat_timeout_ms
            .or_else(|| key_repeat.and_then(|k| k.timeout_ms))
            .unwrap_or(DEFAULT_KEY_REPEAT_TIMEOUT_MS);
        let key_repeat_delay_ms = args
            .key_repeat_delay_ms
            .or_else(|| key_repeat.and_then(|k| k.delay_ms))
            .unwrap_or(DEFAULT_KEY_REPEAT_DELAY_MS);

        Ok(Config {
            key_repeat_enabled,
            key_repeat_timeout: Duration::from_millis(key_repeat_timeout_ms),
            key_repeat_delay: Duration::from_millis(key_repeat_delay_ms),
            channel_capacity: dispatch
                .and_then(|d| d.channel_capacity)
                .unwrap_or(dispatch_proto::DEFAULT_CHANNEL_CAPACITY),
            max_events_per_second: dispatch
                .and_then(|d| d.max_events_per_second)
                .unwrap_or(DEFAULT_MAX_EVENTS_PER_SECOND),
        })
    }
}
