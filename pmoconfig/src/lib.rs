//! # DAAP server configuration module
//!
//! This module provides configuration management for the DAAP server,
//! including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters and setters for configuration values
//! - Thread-safe singleton access pattern
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::get_config;
//!
//! // Get the global configuration
//! let config = get_config();
//!
//! // Access configuration values
//! let port = config.get_port();
//! let name = config.get_name();
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use lazy_static::lazy_static;
use pmoutils::guess_local_ip;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fmt, fs,
    path::Path,
    sync::{Arc, Mutex},
};
use tracing::info;

pub mod encryption;

// Default configuration bundled with the binary.
const DEFAULT_CONFIG: &str = include_str!("daap_server.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> =
        Arc::new(Config::load_config("").expect("Failed to load DAAP server configuration"));
}

const ENV_CONFIG_DIR: &str = "DAAPSERVER_CONFIG";
const ENV_PREFIX: &str = "DAAPSERVER_CONFIG__";

// Default values for configuration.
const DEFAULT_NAME: &str = "DAAP Server";
const DEFAULT_PORT: u16 = 3689;
const DEFAULT_MAX_USERS: usize = 0;
const DEFAULT_PUBLISH: bool = true;
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_LOG_BUFFER_CAPACITY: usize = 1000;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// Authentication mode recognized by `/login`, per the `auth_method` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    Password,
    UserAndPassword,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
            AuthMethod::UserAndPassword => "user_and_password",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(AuthMethod::None),
            "password" => Ok(AuthMethod::Password),
            "user_and_password" => Ok(AuthMethod::UserAndPassword),
            other => Err(anyhow!("unknown auth_method '{other}'")),
        }
    }
}

/// One entry of the `credentials` option: a username (optional for
/// `password`-only auth) and its plaintext or encrypted password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
}

/// Macro to generate getter/setter for usize values with default
macro_rules! impl_usize_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<usize> {
            match self.get_value($path)? {
                Value::Number(n) if n.is_i64() => Ok(n.as_i64().unwrap() as usize),
                Value::Number(n) if n.is_u64() => Ok(n.as_u64().unwrap() as usize),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, size: usize) -> Result<()> {
            let n = Number::from(size);
            self.set_value($path, Value::Number(n))
        }
    };
}

/// Macro to generate getter/setter for bool values with default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path)? {
                Value::Bool(b) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Configuration manager for the DAAP server
///
/// This structure manages the application configuration, including:
/// - Loading configuration from YAML files
/// - Merging with default configuration
/// - Handling environment variable overrides
/// - Providing typed getters/setters for configuration values
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        let data = self.data.lock().unwrap().clone();
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(data),
        }
    }
}

impl Config {
    /// Finds a config directory by trying different locations in order
    fn find_config_dir(directory: &str) -> String {
        if !directory.is_empty() {
            return directory.to_string();
        }

        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load config from env");
            return env_path;
        }

        if Path::new(".daap-server").exists() {
            return ".daap-server".to_string();
        }

        if let Some(home) = home_dir() {
            let home_config = home.join(".daap-server");
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        ".daap-server".to_string()
    }

    /// Validates and prepares a config directory
    fn validate_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(anyhow!("config path is not a directory"));
        }

        let test_file = path.join(".write_test");
        fs::write(&test_file, b"test")?;
        fs::remove_file(&test_file)?;

        fs::read_dir(path)?;

        Ok(())
    }

    /// Determines and validates the configuration directory
    ///
    /// The directory is searched in the following order:
    /// 1. The provided `directory` parameter if not empty
    /// 2. The `DAAPSERVER_CONFIG` environment variable
    /// 3. `.daap-server` in the current directory
    /// 4. `.daap-server` in the user's home directory
    pub fn config_dir(directory: &str) -> String {
        let dir_path = Self::find_config_dir(directory);
        let path = Path::new(&dir_path);

        Self::validate_config_dir(path).expect("unable to validate the configuration directory");

        dir_path
    }

    /// Loads the configuration from the specified directory
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory);
        info!(config_dir = %config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let mut default_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        let yaml_data = if let Ok(data) = fs::read(&path) {
            info!(config_file = %path, "Loaded config file");
            data
        } else {
            info!(config_file = %path, "Config file not found, using default embedded config");
            DEFAULT_CONFIG.as_bytes().to_vec()
        };

        let external_value: Value = serde_yaml::from_slice(&yaml_data)?;
        merge_yaml(&mut default_value, &external_value);
        let mut config_value = Self::lower_keys_value(default_value);

        Self::apply_env_overrides(&mut config_value);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    /// Saves the current configuration to the config.yaml file
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().unwrap();
        let yaml = serde_yaml::to_string(&*data)?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Sets a configuration value at the specified path and saves it
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        Self::set_value_internal(&mut data, path, value.clone())?;
        drop(data);
        self.save()?;
        Ok(())
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Mapping(map) = data {
            let key = path[0].to_lowercase();
            let key_value = Value::String(key.clone());
            if path.len() == 1 {
                map.insert(key_value, value);
            } else {
                let entry = map
                    .entry(key_value)
                    .or_insert(Value::Mapping(Mapping::new()));
                Self::set_value_internal(entry, &path[1..], value)?;
            }
            Ok(())
        } else {
            Err(anyhow!("current node is not a map"))
        }
    }

    /// Gets a configuration value at the specified path
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data.lock().unwrap();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                let key = key.to_lowercase();

                if let Some(next) = map.get(&Value::String(key)) {
                    current = next;
                } else {
                    return Err(anyhow!("path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("path {} is not a config node", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if key.starts_with(ENV_PREFIX) {
                let key_path = key
                    .trim_start_matches(ENV_PREFIX)
                    .split("__")
                    .collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                let _ = Self::set_value_internal(config, &key_path, yaml_value);
            }
        }
    }

    fn convert_env_value(value: &str) -> Value {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
            return parsed;
        }
        Value::String(value.to_string())
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => {
                let mut new_map = Mapping::new();
                for (k, v) in map {
                    if let Value::String(s) = k {
                        let new_key = Value::String(s.to_lowercase());
                        let new_val = Self::lower_keys_value(v);
                        new_map.insert(new_key, new_val);
                    } else {
                        new_map.insert(k, Self::lower_keys_value(v));
                    }
                }
                Value::Mapping(new_map)
            }
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            _ => value,
        }
    }

    /// Display name: realm, mDNS instance name and `/server-info` name.
    pub fn get_name(&self) -> String {
        match self.get_value(&["name"]) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => DEFAULT_NAME.to_string(),
        }
    }

    pub fn set_name(&self, name: String) -> Result<()> {
        self.set_value(&["name"], Value::String(name))
    }

    /// Preferred TCP port. Best-effort: the server binds the first free
    /// port starting here and publishes whatever it actually bound.
    pub fn get_port(&self) -> u16 {
        match self.get_value(&["port"]) {
            Ok(Value::Number(n)) if n.is_i64() => n.as_i64().unwrap() as u16,
            Ok(Value::String(s)) => s.parse().unwrap_or(DEFAULT_PORT),
            _ => DEFAULT_PORT,
        }
    }

    pub fn set_port(&self, port: u16) -> Result<()> {
        self.set_value(&["port"], Value::Number(Number::from(port)))
    }

    /// Local IP/hostname used when nothing more specific is configured.
    pub fn get_base_address(&self) -> String {
        match self.get_value(&["base_address"]) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => guess_local_ip(),
        }
    }

    pub fn get_auth_method(&self) -> AuthMethod {
        match self.get_value(&["auth_method"]) {
            Ok(Value::String(s)) => s.parse().unwrap_or(AuthMethod::None),
            _ => AuthMethod::None,
        }
    }

    pub fn set_auth_method(&self, method: AuthMethod) -> Result<()> {
        self.set_value(&["auth_method"], Value::String(method.to_string()))
    }

    /// The configured (user, password) list. Passwords stored with the
    /// `encrypted:` prefix are transparently decrypted.
    pub fn get_credentials(&self) -> Result<Vec<Credential>> {
        let value = match self.get_value(&["credentials"]) {
            Ok(v) => v,
            Err(_) => return Ok(Vec::new()),
        };
        let Value::Sequence(entries) = value else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let cred: Credential = serde_yaml::from_value(entry)?;
            let password = encryption::get_password(&cred.password).unwrap_or(cred.password);
            out.push(Credential {
                username: cred.username,
                password,
            });
        }
        Ok(out)
    }

    pub fn set_credentials(&self, credentials: &[Credential]) -> Result<()> {
        let seq = credentials
            .iter()
            .map(serde_yaml::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.set_value(&["credentials"], Value::Sequence(seq))
    }

    impl_usize_config!(
        get_max_users,
        set_max_users,
        &["max_users"],
        DEFAULT_MAX_USERS
    );

    impl_bool_config!(get_publish, set_publish, &["publish"], DEFAULT_PUBLISH);

    /// Optional TXT-record `Machine ID`.
    pub fn get_machine_id(&self) -> Option<String> {
        match self.get_value(&["machine_id"]) {
            Ok(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn set_machine_id(&self, machine_id: String) -> Result<()> {
        self.set_value(&["machine_id"], Value::String(machine_id))
    }

    /// Idle session expiry, in seconds.
    pub fn get_session_timeout_secs(&self) -> u64 {
        match self.get_value(&["session_timeout"]) {
            Ok(Value::Number(n)) if n.is_u64() => n.as_u64().unwrap(),
            Ok(Value::Number(n)) if n.is_i64() => n.as_i64().unwrap().max(0) as u64,
            _ => DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }

    pub fn set_session_timeout_secs(&self, secs: u64) -> Result<()> {
        self.set_value(&["session_timeout"], Value::Number(Number::from(secs)))
    }

    impl_usize_config!(
        get_log_cache_size,
        set_log_cache_size,
        &["logger", "buffer_capacity"],
        DEFAULT_LOG_BUFFER_CAPACITY
    );

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    pub fn get_log_min_level(&self) -> Result<String> {
        match self.get_value(&["logger", "min_level"])? {
            Value::String(s) => Ok(s),
            _ => Ok(DEFAULT_LOG_MIN_LEVEL.to_string()),
        }
    }

    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["logger", "min_level"], Value::String(level))
    }
}

/// Returns the global configuration instance
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

/// Merges external YAML configuration into default configuration
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_method_round_trips_through_string() {
        for m in [
            AuthMethod::None,
            AuthMethod::Password,
            AuthMethod::UserAndPassword,
        ] {
            let s = m.to_string();
            assert_eq!(s.parse::<AuthMethod>().unwrap(), m);
        }
    }

    #[test]
    fn merge_yaml_prefers_external_scalars_and_keeps_default_keys() {
        let mut default: Value = serde_yaml::from_str("name: Default\nport: 3689\n").unwrap();
        let external: Value = serde_yaml::from_str("port: 4000\n").unwrap();
        merge_yaml(&mut default, &external);
        assert_eq!(default["name"].as_str().unwrap(), "Default");
        assert_eq!(default["port"].as_i64().unwrap(), 4000);
    }
}
