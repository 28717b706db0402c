//! Playback engine interface.
//!
//! The pause controller never talks to a player directly; it goes through
//! [`MediaPlayer`], which the MPRIS backend implements for the desktop.

use std::sync::Arc;

pub mod mpris;

/// Playback state reported by the player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum PlayerStatus {
   Playing,
   Paused,
   Stopped,
   /// No player, or a player that reports something unrecognized.
   #[default]
   Indeterminate,
}

impl PlayerStatus {
   /// Parses an MPRIS `PlaybackStatus` value.
   pub fn from_mpris(status: &str) -> Self {
      match status {
         "Playing" => Self::Playing,
         "Paused" => Self::Paused,
         "Stopped" => Self::Stopped,
         _ => Self::Indeterminate,
      }
   }
}

/// Control surface of the playback engine.
///
/// Every method is non-blocking: commands are queued and their outcome is
/// only logged.
pub trait MediaPlayer: Send + Sync {
   fn player_status(&self) -> PlayerStatus;

   /// Pauses playback. `suppress_notification` drops the persistent playback
   /// notification, `reinit` asks the engine to reload its media on resume.
   fn pause(&self, suppress_notification: bool, reinit: bool);

   fn resume(&self);

   /// True when another party currently holds the audio output.
   fn is_audio_channel_in_use(&self) -> bool;

   /// True when audio is routed to a remote receiver.
   fn is_casting(&self) -> bool;
}

/// Type alias for a shared player handle.
pub type PlayerHandle = Arc<dyn MediaPlayer>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_status_from_mpris() {
      assert_eq!(PlayerStatus::from_mpris("Playing"), PlayerStatus::Playing);
      assert_eq!(PlayerStatus::from_mpris("Paused"), PlayerStatus::Paused);
      assert_eq!(PlayerStatus::from_mpris("Stopped"), PlayerStatus::Stopped);
      assert_eq!(PlayerStatus::from_mpris("playing"), PlayerStatus::Indeterminate);
      assert_eq!(PlayerStatus::from_mpris(""), PlayerStatus::Indeterminate);
      assert_eq!(PlayerStatus::from_mpris("Indeterminate"), PlayerStatus::Indeterminate);
   }
}
