use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const CONFIG_DIR: &str = "dingding-push";
const ENV_PREFIX: &str = "DINGDING_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub push: PushConfig,
    pub api: ApiConfig,
    pub device: DeviceConfig,
    pub vault: VaultConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    Cn,
    Eu,
    Us,
}

impl Region {
    pub fn api_base_url(self) -> &'static str {
        match self {
            Self::Cn => "https://chniot.lancens.com:6448/",
            Self::Eu => "https://euriot.lancens.com:6448/",
            Self::Us => "https://usaiot.lancens.com:6448/",
        }
    }

    pub fn push_host(self) -> &'static str {
        match self {
            Self::Cn => "chnpush.lancens.com",
            Self::Eu => "eurpush.lancens.com",
            Self::Us => "usapush.lancens.com",
        }
    }

    pub fn push_port(self) -> u16 {
        11001
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cn" => Ok(Self::Cn),
            "eu" => Ok(Self::Eu),
            "us" => Ok(Self::Us),
            other => Err(format!("unknown region '{other}' (expected cn, eu or us)")),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cn => "cn",
            Self::Eu => "eu",
            Self::Us => "us",
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccountConfig {
    pub username: String,
    /// Vault key holding the account password.
    pub password_key: String,
    pub region: Region,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password_key: "account_password".to_string(),
            region: Region::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PushConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: crate::cloud::DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Only notifications for this device UID are turned into events.
    pub uid: Option<String>,
    pub imei: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub json_lines: bool,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self::load_unchecked()?;
        config.validate()?;
        Ok(config)
    }

    /// File plus environment, without validation. Vault maintenance works
    /// before the account section is filled in.
    pub fn load_unchecked() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = active_config_path();
        let mut config = match fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<Config>(&raw)
                .map_err(|err| format!("{}: {err}", config_path.display()))?,
            Err(_) => {
                tracing::debug!(path = %config_path.display(), "no config file, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.apply_overrides(|name| env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(val) = lookup("USERNAME") {
            self.account.username = val;
        }
        if let Some(val) = lookup("PASSWORD_KEY") {
            self.account.password_key = val;
        }
        if let Some(val) = lookup("REGION") {
            self.account.region = val.parse()?;
        }

        if let Some(val) = lookup("PUSH_HOST") {
            self.push.host = Some(val);
        }
        if let Some(val) = lookup("PUSH_PORT") {
            self.push.port = Some(val.parse().map_err(|_| format!("invalid {ENV_PREFIX}PUSH_PORT '{val}'"))?);
        }

        if let Some(val) = lookup("API_BASE_URL") {
            self.api.base_url = Some(val);
        }
        if let Some(val) = lookup("API_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.api.timeout_secs = secs;
            }
        }

        if let Some(val) = lookup("DEVICE_UID") {
            self.device.uid = Some(val);
        }
        if let Some(val) = lookup("IMEI") {
            self.device.imei = Some(val);
        }
        if let Some(val) = lookup("USER_ID") {
            self.device.user_id = Some(val);
        }

        if let Some(val) = lookup("VAULT_PATH") {
            self.vault.path = Some(val);
        }
        if let Some(val) = lookup("JSON_LINES") {
            self.output.json_lines = val.parse().unwrap_or(false);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.account.username.trim().is_empty() {
            return Err("account.username must be set".into());
        }
        if self.account.password_key.trim().is_empty() {
            return Err("account.password_key must be set".into());
        }
        if self.push.port == Some(0) {
            return Err("push.port must be non-zero".into());
        }
        if self.push.host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err("push.host must not be blank".into());
        }
        if self.api.timeout_secs < 1 {
            return Err("api.timeout_secs must be >= 1".into());
        }
        Ok(())
    }

    pub fn push_endpoint(&self) -> (String, u16) {
        let region = self.account.region;
        let host = self
            .push
            .host
            .clone()
            .unwrap_or_else(|| region.push_host().to_string());
        (host, self.push.port.unwrap_or_else(|| region.push_port()))
    }

    pub fn api_base_url(&self) -> String {
        self.api
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.account.region.api_base_url().to_string())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn device_uid(&self) -> Option<String> {
        self.device.uid.clone().filter(|uid| !uid.trim().is_empty())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

/// Per-user directory shared by the config file and the vault.
pub fn config_dir() -> PathBuf {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join(CONFIG_DIR);
    }
    if let Some(home) = env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".config").join(CONFIG_DIR);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join(CONFIG_DIR)
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{ENV_PREFIX}CONFIG_PATH")) {
        return PathBuf::from(path);
    }
    config_dir().join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
