//! Pause-on-disconnect daemon.
//!
//! Pauses the active media player when headphones are unplugged or a
//! Bluetooth headset drops, and resumes it when they come back, according to
//! the user's preferences.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, task::JoinHandle, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::monitor::BluetoothMonitor;
use controller::{Reaction, UnpauseController};
use dbus::{BUS_NAME, ControlSurface, ControllerInterface, OBJECT_PATH};
use event::{AudioEvent, EventBus, EventSource};
use haptics::{FeedbackdHaptics, HapticsHandle, NullHaptics};
use player::mpris::MprisPlayer;

mod bluetooth;
mod config;
mod controller;
mod dbus;
mod error;
mod event;
mod haptics;
mod player;

use crate::{dbus::ControllerInterfaceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting unpause service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration: pause on disconnect={}, resume on headset={}, resume on bluetooth={}",
      config.pause_on_headset_disconnect,
      config.unpause_on_headset_reconnect,
      config.unpause_on_bluetooth_reconnect
   );

   let surface = ControlSurface::new();

   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, surface.interface())?
      .build()
      .await?;

   info!("Control interface started at {BUS_NAME}");

   let player = MprisPlayer::new(connection.clone(), config.clone()).await?;
   let haptics: HapticsHandle =
      match FeedbackdHaptics::new(&connection, config.haptic_event.clone()).await {
         Ok(haptics) => Arc::new(haptics),
         Err(e) => {
            info!("feedbackd unavailable, haptics disabled: {e}");
            Arc::new(NullHaptics)
         },
      };
   let controller = UnpauseController::new(Arc::new(player), haptics, Arc::new(config.clone()));

   let events = EventProcessor::new();
   let dispatcher = events
      .clone()
      .spawn_dispatcher(controller, surface.clone(), &connection)
      .await?;

   let mut subscriptions = vec![surface.subscribe(events.clone())?];
   match BluetoothMonitor::new(config.bluetooth_poll_interval()).await {
      Ok(monitor) => subscriptions.push(monitor.subscribe(events.clone())?),
      Err(e) => warn!("Bluetooth unavailable, only D-Bus events will be handled: {e}"),
   }
   drop(events);

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down unpause service...");

   for subscription in subscriptions {
      subscription.unsubscribe();
   }
   let _ = time::timeout(Duration::from_secs(2), dispatcher).await;

   Ok(())
}

/// Runs one event through the controller and records the outcome.
fn dispatch(
   controller: &mut UnpauseController,
   surface: &ControlSurface,
   event: AudioEvent,
) -> Reaction {
   let reaction = controller.handle(event);
   surface.record(controller.is_transient_pause(), reaction);
   reaction
}

/// Queue between event sources and the controller.
///
/// Sources push from any task; a single dispatcher drains the queue and owns
/// the controller.
struct EventProcessor {
   queue: SegQueue<AudioEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   /// Next queued event, or `None` once every source has let go of the queue.
   async fn recv(self: &Arc<Self>) -> Option<AudioEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn publish(iface: &InterfaceRef<ControllerInterface>, reaction: Reaction) -> Result<()> {
      match reaction {
         Reaction::Paused => {
            iface.playback_paused("audio output disconnected").await?;
         },
         Reaction::Resumed { source, haptic } => {
            iface.playback_resumed(source.into(), haptic).await?;
         },
         Reaction::Ignored | Reaction::Updated => {},
      }
      Ok(())
   }

   async fn spawn_dispatcher(
      self: Arc<Self>,
      mut controller: UnpauseController,
      surface: ControlSurface,
      connection: &Connection,
   ) -> Result<JoinHandle<()>> {
      let iface = connection
         .object_server()
         .interface::<_, ControllerInterface>(OBJECT_PATH)
         .await?;

      Ok(tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            let reaction = dispatch(&mut controller, &surface, event);
            if let Err(e) = Self::publish(&iface, reaction).await {
               warn!("Error publishing {reaction:?}: {e}");
            }
         }
         info!("Event dispatcher stopped");
      }))
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: AudioEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;
   use crate::{
      config::Config,
      controller::ReconnectSource,
      event::ConnectionState,
      player::{MediaPlayer, PlayerStatus},
   };

   struct StubPlayer {
      status: Mutex<PlayerStatus>,
   }

   impl MediaPlayer for StubPlayer {
      fn player_status(&self) -> PlayerStatus {
         *self.status.lock()
      }

      fn pause(&self, _suppress_notification: bool, _reinit: bool) {
         *self.status.lock() = PlayerStatus::Paused;
      }

      fn resume(&self) {
         *self.status.lock() = PlayerStatus::Playing;
      }

      fn is_audio_channel_in_use(&self) -> bool {
         false
      }

      fn is_casting(&self) -> bool {
         false
      }
   }

   fn controller(config: Config) -> UnpauseController {
      let player = Arc::new(StubPlayer {
         status: Mutex::new(PlayerStatus::Playing),
      });
      UnpauseController::new(player, Arc::new(NullHaptics), Arc::new(config))
   }

   #[test]
   fn test_dispatch_records_status() {
      let config = Config {
         unpause_on_bluetooth_reconnect: true,
         ..Config::default()
      };
      let mut controller = controller(config);
      let surface = ControlSurface::new();

      let reaction = dispatch(&mut controller, &surface, AudioEvent::BecomingNoisy);
      assert_eq!(reaction, Reaction::Paused);
      let status = surface.status();
      assert!(status.transient_pause);
      assert_eq!(status.last_reaction, Reaction::Paused);
      assert_eq!(status.events_handled, 1);

      let reaction = dispatch(
         &mut controller,
         &surface,
         AudioEvent::BluetoothConnectionState(ConnectionState::Connected),
      );
      assert_eq!(
         reaction,
         Reaction::Resumed {
            source: ReconnectSource::Bluetooth,
            haptic: true,
         }
      );
      let status = surface.status();
      assert!(!status.transient_pause);
      assert_eq!(status.last_reaction, reaction);
      assert_eq!(status.events_handled, 2);

      dispatch(
         &mut controller,
         &surface,
         AudioEvent::HeadsetPlug {
            initial: true,
            state: Some(1),
         },
      );
      let status = surface.status();
      assert_eq!(status.last_reaction, Reaction::Ignored);
      assert_eq!(status.events_handled, 3);
   }

   #[tokio::test]
   async fn test_queue_drains_in_order_then_closes() {
      let events = EventProcessor::new();
      let sender: Arc<dyn EventBus> = events.clone();
      sender.emit(AudioEvent::BecomingNoisy);
      sender.emit(AudioEvent::BluetoothConnectionState(ConnectionState::Connected));
      drop(sender);

      assert_eq!(events.recv().await, Some(AudioEvent::BecomingNoisy));
      assert_eq!(
         events.recv().await,
         Some(AudioEvent::BluetoothConnectionState(ConnectionState::Connected))
      );
      assert_eq!(events.recv().await, None);
   }
}
