use anyhow::{Context, Result, anyhow};
use dotenvy::dotenv;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use url::Url;

use crate::session::{KeyringStore, is_keyring_unavailable};

pub const KEYRING_SERVICE: &str = "rcam";
const PASSWORD_KEYRING_PREFIX: &str = "password";
const DEVICE_SESSION_KEYRING_PREFIX: &str = "session";
const PLATFORM_SESSION_KEYRING_USER: &str = "sensecraft";

pub const DEFAULT_DEVICE_URL: &str = "http://192.168.42.1";
pub const DEFAULT_USERNAME: &str = "recamera";

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ConfigFile {
    pub device_url: Option<Url>,
    pub username: Option<String>,
    pub portal_url: Option<Url>,
    pub sensecraft_url: Option<Url>,
    pub train_url: Option<Url>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigEnv {
    device_url: Option<Url>,
    username: Option<String>,
    password: Option<String>,
    portal_url: Option<Url>,
    sensecraft_url: Option<Url>,
    train_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct PlatformUrls {
    pub portal: Url,
    pub sensecraft: Url,
    pub train: Url,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub device_url: Url,
    pub username: String,
    pub password: Option<String>,
    pub platform: Option<PlatformUrls>,
}

impl Config {
    pub fn platform(&self) -> Result<&PlatformUrls> {
        self.platform.as_ref().ok_or(anyhow!(
            "SenseCraft URLs are not configured (set portal_url, sensecraft_url and train_url)"
        ))
    }

    /// Device sessions are keyed by host so several cameras can be used side by side.
    pub fn device_session_store(&self) -> Result<KeyringStore> {
        KeyringStore::new(KEYRING_SERVICE, &device_key(DEVICE_SESSION_KEYRING_PREFIX, &self.device_url))
    }

    pub fn platform_session_store(&self) -> Result<KeyringStore> {
        KeyringStore::new(KEYRING_SERVICE, PLATFORM_SESSION_KEYRING_USER)
    }
}

fn device_key(prefix: &str, device_url: &Url) -> String {
    match device_url.port() {
        Some(port) => format!(
            "{}@{}:{}",
            prefix,
            device_url.host_str().unwrap_or_default(),
            port
        ),
        None => format!("{}@{}", prefix, device_url.host_str().unwrap_or_default()),
    }
}

fn merge_platform(base: &ConfigFile, env: &ConfigEnv) -> Option<PlatformUrls> {
    Some(PlatformUrls {
        portal: env.portal_url.clone().or(base.portal_url.clone())?,
        sensecraft: env.sensecraft_url.clone().or(base.sensecraft_url.clone())?,
        train: env.train_url.clone().or(base.train_url.clone())?,
    })
}

fn merge_config(base: ConfigFile, override_config: ConfigEnv) -> Result<Config> {
    let platform = merge_platform(&base, &override_config);

    let device_url = override_config
        .device_url
        .or(base.device_url)
        .map(Ok)
        .unwrap_or_else(|| Url::parse(DEFAULT_DEVICE_URL))?;

    let username = override_config
        .username
        .or(base.username)
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());

    let password = match override_config.password {
        Some(password) => Some(password),
        None => read_password_keyring(&device_url)?,
    };

    Ok(Config {
        device_url,
        username,
        password,
        platform,
    })
}

fn config_path() -> Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("com", "seeed", "rcam")
        .ok_or(anyhow!("Unable to determine home directory"))?;
    Ok(project_dirs.config_dir().join("config.toml"))
}

pub fn read_config_file() -> Result<ConfigFile> {
    let config_file = config_path()?;
    if let Ok(config) = fs::read_to_string(&config_file) {
        toml::from_str(&config)
            .with_context(|| format!("Failed to parse {}", config_file.display()))
    } else {
        Ok(ConfigFile::default())
    }
}

pub fn read_config() -> Result<Config> {
    let _ = dotenv();
    merge_config(read_config_file()?, env_config(std::env::vars())?)
}

fn env_config(vars: impl IntoIterator<Item = (String, String)>) -> Result<ConfigEnv> {
    envy::prefixed("RCAM_")
        .from_iter(vars)
        .context("Invalid RCAM_* environment")
}

pub fn write_config(config: ConfigFile) -> Result<()> {
    let config_file = config_path()?;
    if let Some(parent) = config_file.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    fs::write(&config_file, toml::to_string_pretty(&config)?)
        .with_context(|| format!("Failed to write {}", config_file.display()))?;
    tracing::debug!("Wrote {}", config_file.display());
    Ok(())
}

fn read_password_keyring(device_url: &Url) -> Result<Option<String>> {
    let secret = Entry::new(KEYRING_SERVICE, &device_key(PASSWORD_KEYRING_PREFIX, device_url))
        .and_then(|entry| entry.get_secret());
    stored_password(secret)
}

fn stored_password(secret: keyring::Result<Vec<u8>>) -> Result<Option<String>> {
    match secret {
        Ok(secret) => Ok(Some(String::from_utf8(secret)?)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) if is_keyring_unavailable(&e) => {
            tracing::warn!("OS keyring unavailable, continuing without a stored password: {}", e);
            Ok(None)
        }
        Err(e) => Err(e).context("Unable to read the device password from the OS keyring"),
    }
}

pub fn set_password_keyring(device_url: &Url, password: String) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, &device_key(PASSWORD_KEYRING_PREFIX, device_url))?;
    entry.set_secret(password.as_bytes())?;
    println!("Password stored for {}", device_url);
    Ok(())
}
