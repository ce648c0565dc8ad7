//! Configuration management for the daemon and sessions.
//!
//! This module handles loading and saving the TOML configuration from disk:
//! the service identity, session timeouts and advertising intervals.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   error::{LinkError, Result},
   identity::{ServiceIdentity, parse_uuid},
};

/// Main configuration structure.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// BlueZ adapter name; the default adapter is used when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   /// Scan timeout in seconds, 0 scans until cancelled.
   #[serde(default = "default_scan_timeout")]
   pub scan_timeout_sec: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_unsubscribe_timeout")]
   pub unsubscribe_timeout_ms: u64,

   #[serde(default)]
   pub service: ServiceConfig,

   #[serde(default)]
   pub advertising: AdvertisingConfig,
}

/// Service the central looks for and the peripheral exposes.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServiceConfig {
   #[serde(default = "default_service_name")]
   pub name: String,
   #[serde(default = "default_service_uuid")]
   pub service_uuid: String,
   #[serde(default = "default_characteristic_uuids")]
   pub characteristic_uuids: Vec<String>,
}

/// Advertising interval ranges, in milliseconds, per profile.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvertisingConfig {
   #[serde(default = "default_foreground_interval")]
   pub foreground_interval_ms: (u64, u64),
   #[serde(default = "default_background_interval")]
   pub background_interval_ms: (u64, u64),
}

/// Bounds applied by the central session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
   pub scan: Option<Duration>,
   pub connect: Duration,
   pub unsubscribe: Duration,
}

impl Default for Timeouts {
   fn default() -> Self {
      Self {
         scan: None,
         connect: Duration::from_secs(default_connect_timeout()),
         unsubscribe: Duration::from_millis(default_unsubscribe_timeout()),
      }
   }
}

fn default_service_name() -> String {
   "gattlink".to_owned()
}

fn default_service_uuid() -> String {
   "7e5c0de0-4c1b-4d2a-9f3e-2b8a6c1d0e57".to_owned()
}

fn default_characteristic_uuids() -> Vec<String> {
   vec!["c0de".to_owned()]
}

const fn default_scan_timeout() -> u64 {
   30
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_unsubscribe_timeout() -> u64 {
   2000
}

const fn default_foreground_interval() -> (u64, u64) {
   (100, 150)
}

const fn default_background_interval() -> (u64, u64) {
   (1000, 1500)
}

impl Default for ServiceConfig {
   fn default() -> Self {
      Self {
         name: default_service_name(),
         service_uuid: default_service_uuid(),
         characteristic_uuids: default_characteristic_uuids(),
      }
   }
}

impl Default for AdvertisingConfig {
   fn default() -> Self {
      Self {
         foreground_interval_ms: default_foreground_interval(),
         background_interval_ms: default_background_interval(),
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         service: ServiceConfig::default(),
         scan_timeout_sec: default_scan_timeout(),
         connect_timeout_sec: default_connect_timeout(),
         unsubscribe_timeout_ms: default_unsubscribe_timeout(),
         advertising: AdvertisingConfig::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("GATTLINK_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(LinkError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("gattlink").join("config.toml"))
   }

   /// Builds the validated service identity.
   pub fn identity(&self) -> Result<ServiceIdentity> {
      let service_uuid = parse_uuid(&self.service.service_uuid)?;
      let characteristics = self
         .service
         .characteristic_uuids
         .iter()
         .map(|s| parse_uuid(s))
         .collect::<Result<Vec<_>>>()?;
      ServiceIdentity::new(self.service.name.as_str(), service_uuid, characteristics)
   }

   pub fn timeouts(&self) -> Timeouts {
      Timeouts {
         scan: (self.scan_timeout_sec > 0).then(|| Duration::from_secs(self.scan_timeout_sec)),
         connect: Duration::from_secs(self.connect_timeout_sec),
         unsubscribe: Duration::from_millis(self.unsubscribe_timeout_ms),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::identity::uuid16;
   use tempfile::TempDir;

   #[test]
   fn test_load_creates_default() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(&path)?;
      assert!(path.exists());
      assert_eq!(config.connect_timeout_sec, 10);

      let identity = config.identity()?;
      assert_eq!(identity.name(), "gattlink");
      assert_eq!(identity.characteristic_uuids(), &[uuid16(0xc0de)]);
      Ok(())
   }

   #[test]
   fn test_partial_file_uses_defaults() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         r#"
scan_timeout_sec = 0

[service]
name = "heart"
service_uuid = "180d"
characteristic_uuids = ["2a37", "2a38"]
"#,
      )?;

      let config = Config::load_from(&path)?;
      assert_eq!(config.timeouts().scan, None);
      assert_eq!(config.timeouts().unsubscribe, Duration::from_millis(2000));
      assert_eq!(config.advertising, AdvertisingConfig::default());

      let identity = config.identity()?;
      assert_eq!(identity.service_uuid(), uuid16(0x180d));
      assert_eq!(
         identity.characteristic_uuids(),
         &[uuid16(0x2a37), uuid16(0x2a38)]
      );
      Ok(())
   }

   #[test]
   fn test_save_round_trip() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("config.toml");

      let mut config = Config::default();
      config.adapter = Some("hci1".into());
      config.scan_timeout_sec = 5;
      config.save_to(&path)?;

      let loaded = Config::load_from(&path)?;
      assert_eq!(loaded.adapter.as_deref(), Some("hci1"));
      assert_eq!(loaded.timeouts().scan, Some(Duration::from_secs(5)));
      Ok(())
   }

   #[test]
   fn test_invalid_uuid_rejected() {
      let mut config = Config::default();
      config.service.characteristic_uuids = vec!["zz".into()];
      assert!(matches!(config.identity(), Err(LinkError::InvalidUuid(_))));
   }
}
