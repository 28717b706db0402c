//! Pause-on-disconnect and resume-on-reconnect policy.
//!
//! The controller reacts to audio output events: it pauses the player when the
//! output disappears and, if that pause was ours, resumes it once a headset or
//! Bluetooth device comes back. It owns the "transient pause" state, so it
//! must be driven from a single event queue.

use std::{sync::Arc, time::Duration};

use log::{debug, error, info};
use serde::Serialize;

use crate::{
   config::Preferences,
   event::{AudioEvent, ConnectionState, HeadsetState},
   haptics::HapticsHandle,
   player::{PlayerHandle, PlayerStatus},
};

/// Length of the vibration announcing a Bluetooth-triggered resume.
pub const RESUME_HAPTIC_PULSE: Duration = Duration::from_millis(500);

/// Where a reconnect came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReconnectSource {
   Headset,
   Bluetooth,
}

/// What the controller did in response to an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Reaction {
   /// Nothing changed.
   #[default]
   Ignored,
   /// Transient-pause state changed but no command was sent.
   Updated,
   Paused,
   Resumed { source: ReconnectSource, haptic: bool },
}

/// Pauses and resumes the player as audio outputs come and go.
pub struct UnpauseController {
   player: PlayerHandle,
   haptics: HapticsHandle,
   prefs: Arc<dyn Preferences>,
   /// Playback was running and got paused by a disconnect, not by the user.
   transient_pause: bool,
}

impl UnpauseController {
   pub fn new(player: PlayerHandle, haptics: HapticsHandle, prefs: Arc<dyn Preferences>) -> Self {
      Self {
         player,
         haptics,
         prefs,
         transient_pause: false,
      }
   }

   pub const fn is_transient_pause(&self) -> bool {
      self.transient_pause
   }

   /// Routes an event to its handler.
   pub fn handle(&mut self, event: AudioEvent) -> Reaction {
      match event {
         AudioEvent::HeadsetPlug { initial, state } => self.on_headset_state_change(initial, state),
         AudioEvent::BluetoothConnectionState(state) => self.on_bluetooth_state_change(state),
         AudioEvent::BecomingNoisy => self.on_audio_becoming_noisy(),
      }
   }

   /// Handles a wired headset plug event.
   ///
   /// Unplugging only logs: the pause comes from the "becoming noisy" event
   /// that accompanies it.
   pub fn on_headset_state_change(&mut self, initial: bool, state: Option<i32>) -> Reaction {
      if initial {
         // Replay of the current state on subscription, not a transition
         return Reaction::Ignored;
      }

      let Some(raw) = state else {
         error!("Received invalid headset plug event without a state");
         return Reaction::Ignored;
      };
      debug!("Headset plug event. State is {raw}");

      match HeadsetState::from_repr(raw) {
         Some(HeadsetState::Unplugged) => {
            debug!("Headset was unplugged during playback");
            Reaction::Ignored
         },
         Some(HeadsetState::Plugged) => {
            debug!("Headset was plugged in during playback");
            self.unpause_if_pause_on_disconnect(ReconnectSource::Headset)
         },
         None => {
            error!("Received headset plug event with unknown state {raw}");
            Reaction::Ignored
         },
      }
   }

   /// Handles a Bluetooth audio connection state change.
   pub fn on_bluetooth_state_change(&mut self, state: ConnectionState) -> Reaction {
      if state == ConnectionState::Connected {
         self.on_bluetooth_audio_connected()
      } else {
         debug!("Ignoring bluetooth connection state {state}");
         Reaction::Ignored
      }
   }

   pub fn on_bluetooth_audio_connected(&mut self) -> Reaction {
      debug!("Received bluetooth connection event");
      self.unpause_if_pause_on_disconnect(ReconnectSource::Bluetooth)
   }

   /// Handles the audio route changing away from the current output.
   pub fn on_audio_becoming_noisy(&mut self) -> Reaction {
      debug!("Pausing playback because audio is becoming noisy");
      self.pause_if_pause_on_disconnect()
   }

   /// Pauses playback if the user asked for it, remembering whether it was
   /// playing.
   pub fn pause_if_pause_on_disconnect(&mut self) -> Reaction {
      let was_transient = self.transient_pause;
      self.transient_pause = self.player.player_status() == PlayerStatus::Playing;

      if self.prefs.pause_on_headset_disconnect() && !self.player.is_casting() {
         info!("Audio output disconnected, pausing playback");
         self.player.pause(!self.prefs.persist_notification(), false);
         Reaction::Paused
      } else if was_transient != self.transient_pause {
         Reaction::Updated
      } else {
         Reaction::Ignored
      }
   }

   /// Resumes playback if it was paused by a disconnect and the user asked
   /// for resumes from `source`.
   pub fn unpause_if_pause_on_disconnect(&mut self, source: ReconnectSource) -> Reaction {
      if self.player.is_audio_channel_in_use() {
         debug!("Not resuming on {source} reconnect, audio is in use");
         return Reaction::Ignored;
      }
      if !self.transient_pause {
         return Reaction::Ignored;
      }
      self.transient_pause = false;

      match source {
         ReconnectSource::Headset if self.prefs.unpause_on_headset_reconnect() => {
            info!("Headset reconnected, resuming playback");
            self.player.resume();
            Reaction::Resumed {
               source,
               haptic: false,
            }
         },
         ReconnectSource::Bluetooth if self.prefs.unpause_on_bluetooth_reconnect() => {
            info!("Bluetooth audio reconnected, resuming playback");
            self.haptics.vibrate(RESUME_HAPTIC_PULSE);
            self.player.resume();
            Reaction::Resumed {
               source,
               haptic: true,
            }
         },
         _ => Reaction::Updated,
      }
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;
   use crate::{config::Config, haptics::Haptics, player::MediaPlayer};

   #[derive(Debug, Clone, Copy, PartialEq, Eq)]
   enum Call {
      Pause {
         suppress_notification: bool,
         reinit: bool,
      },
      Resume,
   }

   #[derive(Default)]
   struct FakePlayer {
      status: Mutex<PlayerStatus>,
      in_use: Mutex<bool>,
      casting: Mutex<bool>,
      calls: Mutex<Vec<Call>>,
   }

   impl FakePlayer {
      fn with_status(status: PlayerStatus) -> Arc<Self> {
         let player = Self::default();
         *player.status.lock() = status;
         Arc::new(player)
      }

      fn calls(&self) -> Vec<Call> {
         self.calls.lock().clone()
      }
   }

   impl MediaPlayer for FakePlayer {
      fn player_status(&self) -> PlayerStatus {
         *self.status.lock()
      }

      fn pause(&self, suppress_notification: bool, reinit: bool) {
         *self.status.lock() = PlayerStatus::Paused;
         self.calls.lock().push(Call::Pause {
            suppress_notification,
            reinit,
         });
      }

      fn resume(&self) {
         *self.status.lock() = PlayerStatus::Playing;
         self.calls.lock().push(Call::Resume);
      }

      fn is_audio_channel_in_use(&self) -> bool {
         *self.in_use.lock()
      }

      fn is_casting(&self) -> bool {
         *self.casting.lock()
      }
   }

   #[derive(Default)]
   struct FakeHaptics {
      pulses: Mutex<Vec<Duration>>,
   }

   impl Haptics for FakeHaptics {
      fn vibrate(&self, duration: Duration) {
         self.pulses.lock().push(duration);
      }
   }

   struct Harness {
      player: Arc<FakePlayer>,
      haptics: Arc<FakeHaptics>,
      controller: UnpauseController,
   }

   fn harness(status: PlayerStatus, config: Config) -> Harness {
      let player = FakePlayer::with_status(status);
      let haptics = Arc::new(FakeHaptics::default());
      let controller = UnpauseController::new(player.clone(), haptics.clone(), Arc::new(config));
      Harness {
         player,
         haptics,
         controller,
      }
   }

   fn all_enabled() -> Config {
      Config {
         unpause_on_bluetooth_reconnect: true,
         ..Config::default()
      }
   }

   #[test]
   fn test_initial_broadcast_is_ignored() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());
      h.controller.transient_pause = true;

      for state in [Some(0), Some(1), Some(42), None] {
         let reaction = h.controller.on_headset_state_change(true, state);
         assert_eq!(reaction, Reaction::Ignored);
      }

      assert!(h.controller.is_transient_pause());
      assert!(h.player.calls().is_empty());
   }

   #[test]
   fn test_noisy_pauses_playing_player() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());

      let reaction = h.controller.handle(AudioEvent::BecomingNoisy);

      assert_eq!(reaction, Reaction::Paused);
      assert!(h.controller.is_transient_pause());
      assert_eq!(
         h.player.calls(),
         vec![Call::Pause {
            suppress_notification: false,
            reinit: false
         }]
      );
   }

   #[test]
   fn test_pause_suppresses_notification_when_not_persisted() {
      let config = Config {
         persist_notification: false,
         ..Config::default()
      };
      let mut h = harness(PlayerStatus::Playing, config);

      h.controller.on_audio_becoming_noisy();

      assert_eq!(
         h.player.calls(),
         vec![Call::Pause {
            suppress_notification: true,
            reinit: false
         }]
      );
   }

   #[test]
   fn test_noisy_while_paused_is_not_transient() {
      let mut h = harness(PlayerStatus::Paused, all_enabled());

      h.controller.on_audio_becoming_noisy();
      assert!(!h.controller.is_transient_pause());

      // A later reconnect must not start playback the user paused
      let reaction = h.controller.on_headset_state_change(false, Some(1));
      assert_eq!(reaction, Reaction::Ignored);
      assert!(!h.player.calls().contains(&Call::Resume));
   }

   #[test]
   fn test_disabled_pause_still_tracks_playing_state() {
      let config = Config {
         pause_on_headset_disconnect: false,
         ..Config::default()
      };
      let mut h = harness(PlayerStatus::Playing, config);

      let reaction = h.controller.on_audio_becoming_noisy();

      assert_eq!(reaction, Reaction::Updated);
      assert!(h.controller.is_transient_pause());
      assert!(h.player.calls().is_empty());

      *h.player.status.lock() = PlayerStatus::Stopped;
      let reaction = h.controller.on_audio_becoming_noisy();
      assert_eq!(reaction, Reaction::Updated);
      assert!(!h.controller.is_transient_pause());
      assert!(h.player.calls().is_empty());
   }

   #[test]
   fn test_casting_prevents_pause() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());
      *h.player.casting.lock() = true;

      let reaction = h.controller.on_audio_becoming_noisy();

      assert_ne!(reaction, Reaction::Paused);
      assert!(h.controller.is_transient_pause());
      assert!(h.player.calls().is_empty());
   }

   #[test]
   fn test_headset_replug_resumes_once() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());
      h.controller.on_audio_becoming_noisy();

      let reaction = h.controller.handle(AudioEvent::HeadsetPlug {
         initial: false,
         state: Some(1),
      });
      assert_eq!(
         reaction,
         Reaction::Resumed {
            source: ReconnectSource::Headset,
            haptic: false
         }
      );
      assert!(!h.controller.is_transient_pause());

      // The flag is consumed, a second plug event does nothing
      let reaction = h.controller.on_headset_state_change(false, Some(1));
      assert_eq!(reaction, Reaction::Ignored);

      let resumes = h.player.calls().iter().filter(|c| **c == Call::Resume).count();
      assert_eq!(resumes, 1);
      assert!(h.haptics.pulses.lock().is_empty());
   }

   #[test]
   fn test_headset_replug_respects_preference() {
      let config = Config {
         unpause_on_headset_reconnect: false,
         ..Config::default()
      };
      let mut h = harness(PlayerStatus::Playing, config);
      h.controller.on_audio_becoming_noisy();

      let reaction = h.controller.on_headset_state_change(false, Some(1));

      assert_eq!(reaction, Reaction::Updated);
      assert!(!h.controller.is_transient_pause());
      assert!(!h.player.calls().contains(&Call::Resume));
   }

   #[test]
   fn test_unplug_only_logs() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());

      let reaction = h.controller.on_headset_state_change(false, Some(0));

      assert_eq!(reaction, Reaction::Ignored);
      assert!(!h.controller.is_transient_pause());
      assert!(h.player.calls().is_empty());
   }

   #[test]
   fn test_invalid_headset_state_is_ignored() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());
      h.controller.transient_pause = true;

      assert_eq!(h.controller.on_headset_state_change(false, None), Reaction::Ignored);
      assert_eq!(h.controller.on_headset_state_change(false, Some(-1)), Reaction::Ignored);
      assert_eq!(h.controller.on_headset_state_change(false, Some(5)), Reaction::Ignored);

      assert!(h.controller.is_transient_pause());
      assert!(h.player.calls().is_empty());
   }

   #[test]
   fn test_bluetooth_reconnect_vibrates_and_resumes() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());
      h.controller.on_audio_becoming_noisy();

      let reaction = h
         .controller
         .handle(AudioEvent::BluetoothConnectionState(ConnectionState::Connected));

      assert_eq!(
         reaction,
         Reaction::Resumed {
            source: ReconnectSource::Bluetooth,
            haptic: true
         }
      );
      assert_eq!(*h.haptics.pulses.lock(), vec![RESUME_HAPTIC_PULSE]);
      assert_eq!(h.player.calls().last(), Some(&Call::Resume));
      assert!(!h.controller.is_transient_pause());
   }

   #[test]
   fn test_bluetooth_reconnect_disabled_by_default() {
      let mut h = harness(PlayerStatus::Playing, Config::default());
      h.controller.on_audio_becoming_noisy();

      let reaction = h.controller.on_bluetooth_audio_connected();

      assert_eq!(reaction, Reaction::Updated);
      assert!(!h.controller.is_transient_pause());
      assert!(h.haptics.pulses.lock().is_empty());
      assert!(!h.player.calls().contains(&Call::Resume));
   }

   #[test]
   fn test_other_bluetooth_states_are_ignored() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());
      h.controller.on_audio_becoming_noisy();

      for state in [
         ConnectionState::Disconnected,
         ConnectionState::Connecting,
         ConnectionState::Disconnecting,
      ] {
         let reaction = h.controller.on_bluetooth_state_change(state);
         assert_eq!(reaction, Reaction::Ignored);
      }
      assert!(h.controller.is_transient_pause());
   }

   #[test]
   fn test_channel_in_use_blocks_reconnect() {
      let mut h = harness(PlayerStatus::Playing, all_enabled());
      h.controller.on_audio_becoming_noisy();
      *h.player.in_use.lock() = true;

      assert_eq!(h.controller.on_headset_state_change(false, Some(1)), Reaction::Ignored);
      assert_eq!(h.controller.on_bluetooth_audio_connected(), Reaction::Ignored);

      // The pause stays eligible for a later resume
      assert!(h.controller.is_transient_pause());
      assert!(h.haptics.pulses.lock().is_empty());
      assert!(!h.player.calls().contains(&Call::Resume));

      *h.player.in_use.lock() = false;
      assert_eq!(
         h.controller.on_headset_state_change(false, Some(1)),
         Reaction::Resumed {
            source: ReconnectSource::Headset,
            haptic: false
         }
      );
   }

   #[test]
   fn test_reaction_serializes_for_status() {
      let json = serde_json::to_value(Reaction::Resumed {
         source: ReconnectSource::Bluetooth,
         haptic: true,
      })
      .unwrap();
      assert_eq!(
         json,
         serde_json::json!({"kind": "resumed", "source": "bluetooth", "haptic": true})
      );
      assert_eq!(
         serde_json::to_value(Reaction::Paused).unwrap(),
         serde_json::json!({"kind": "paused"})
      );
   }
}
