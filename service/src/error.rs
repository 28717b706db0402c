//! Error types for the unpause daemon.
//!
//! The pause controller itself never fails; these errors come from the
//! plumbing around it: Bluetooth, D-Bus, configuration and I/O.

use thiserror::Error;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum UnpauseError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Invalid configuration: {0}")]
   InvalidConfig(&'static str),
}

/// Convenience type alias for Results with `UnpauseError`.
pub type Result<T> = std::result::Result<T, UnpauseError>;
