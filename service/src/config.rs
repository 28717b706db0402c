//! Configuration management for the unpause daemon.
//!
//! Holds the user's pause/resume preferences along with the settings for the
//! player and Bluetooth backends, loaded from a TOML file on disk.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UnpauseError};

/// The preference flags consulted by the pause controller.
pub trait Preferences: Send + Sync {
   /// Pause playback when the audio output goes away.
   fn pause_on_headset_disconnect(&self) -> bool;

   /// Resume a transient pause when a wired headset is plugged back in.
   fn unpause_on_headset_reconnect(&self) -> bool;

   /// Resume a transient pause when a Bluetooth audio device reconnects.
   fn unpause_on_bluetooth_reconnect(&self) -> bool;

   /// Keep the playback notification around while paused.
   fn persist_notification(&self) -> bool;
}

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default = "default_true")]
   pub pause_on_headset_disconnect: bool,

   #[serde(default = "default_true")]
   pub unpause_on_headset_reconnect: bool,

   #[serde(default)]
   pub unpause_on_bluetooth_reconnect: bool,

   #[serde(default = "default_true")]
   pub persist_notification: bool,

   /// MPRIS bus-name suffix or identity of the player to control.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub player: Option<String>,

   /// Identity patterns of players whose audio plays on another device.
   #[serde(default = "default_remote_players")]
   pub remote_players: Vec<String>,

   #[serde(default = "default_haptic_event")]
   pub haptic_event: String,

   #[serde(default = "default_bluetooth_poll_interval")]
   pub bluetooth_poll_interval_sec: u64,
}

const fn default_true() -> bool {
   true
}

fn default_remote_players() -> Vec<String> {
   vec!["kdeconnect".to_string()]
}

fn default_haptic_event() -> String {
   "bluetooth-connected".to_string()
}

const fn default_bluetooth_poll_interval() -> u64 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         pause_on_headset_disconnect: true,
         unpause_on_headset_reconnect: true,
         unpause_on_bluetooth_reconnect: false,
         persist_notification: true,
         player: None,
         remote_players: default_remote_players(),
         haptic_event: default_haptic_event(),
         bluetooth_poll_interval_sec: default_bluetooth_poll_interval(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         let config: Self = toml::from_str(&contents)?;
         config.validate()?;
         Ok(config)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   /// Rejects values the backends cannot run with.
   pub fn validate(&self) -> Result<()> {
      if self.bluetooth_poll_interval_sec == 0 {
         return Err(UnpauseError::InvalidConfig(
            "bluetooth_poll_interval_sec must be positive",
         ));
      }
      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("UNPAUSED_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home).join("unpaused")
      } else if let Some(config_home) = dirs::config_dir() {
         config_home.join("unpaused")
      } else {
         return Err(UnpauseError::ConfigDirNotFound);
      };

      Ok(config_dir.join("config.toml"))
   }

   pub const fn bluetooth_poll_interval(&self) -> Duration {
      Duration::from_secs(self.bluetooth_poll_interval_sec)
   }

   /// Checks whether a player identity belongs to a remote output device.
   pub fn is_remote_player(&self, identity: &str) -> bool {
      let identity = identity.to_ascii_lowercase();
      self
         .remote_players
         .iter()
         .any(|p| identity.contains(&p.to_ascii_lowercase()))
   }
}

impl Preferences for Config {
   fn pause_on_headset_disconnect(&self) -> bool {
      self.pause_on_headset_disconnect
   }

   fn unpause_on_headset_reconnect(&self) -> bool {
      self.unpause_on_headset_reconnect
   }

   fn unpause_on_bluetooth_reconnect(&self) -> bool {
      self.unpause_on_bluetooth_reconnect
   }

   fn persist_notification(&self) -> bool {
      self.persist_notification
   }
}
