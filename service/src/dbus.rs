//! D-Bus control surface.
//!
//! Wired jack events have no native signal on the session bus; acpid or udev
//! hooks report them by calling `HeadsetPlug` here. The same interface
//! publishes what the controller did.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   controller::Reaction,
   error::Result,
   event::{AudioEvent, ConnectionState, EventSender, EventSource, Subscription},
};

pub const BUS_NAME: &str = "org.unpaused";
pub const OBJECT_PATH: &str = "/org/unpaused/controller";

/// Payload value meaning "no state supplied" on a headset plug event.
const HEADSET_STATE_MISSING: i32 = -1;

/// Snapshot of the controller published over `GetStatus`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
   pub transient_pause: bool,
   pub last_reaction: Reaction,
   pub events_handled: u64,
}

#[derive(Default)]
struct SurfaceInner {
   sink: RwLock<Option<EventSender>>,
   status: Mutex<ControllerStatus>,
}

/// Event source fed by D-Bus method calls.
#[derive(Clone, Default)]
pub struct ControlSurface(Arc<SurfaceInner>);

impl ControlSurface {
   pub fn new() -> Self {
      Self::default()
   }

   /// The object to serve at [`OBJECT_PATH`].
   pub fn interface(&self) -> ControllerInterface {
      ControllerInterface {
         surface: self.clone(),
      }
   }

   /// Records the outcome of one handled event.
   pub fn record(&self, transient_pause: bool, reaction: Reaction) {
      let mut status = self.0.status.lock();
      status.transient_pause = transient_pause;
      status.last_reaction = reaction;
      status.events_handled += 1;
   }

   pub fn status(&self) -> ControllerStatus {
      *self.0.status.lock()
   }

   fn forward(&self, event: AudioEvent) -> zbus::fdo::Result<()> {
      let sink = self.0.sink.read();
      let sink = sink
         .as_ref()
         .ok_or_else(|| zbus::fdo::Error::Failed("Controller is not listening".into()))?;
      debug!("D-Bus event: {event:?}");
      sink.emit(event);
      Ok(())
   }
}

impl EventSource for ControlSurface {
   fn subscribe(&self, sink: EventSender) -> Result<Subscription> {
      *self.0.sink.write() = Some(sink);
      let inner = self.0.clone();
      Ok(Subscription::new("dbus").on_cancel(move || {
         inner.sink.write().take();
      }))
   }
}

/// Translates the raw headset plug payload, where `-1` means "missing".
fn headset_event(state: i32, initial: bool) -> AudioEvent {
   AudioEvent::HeadsetPlug {
      initial,
      state: (state != HEADSET_STATE_MISSING).then_some(state),
   }
}

pub struct ControllerInterface {
   surface: ControlSurface,
}

#[interface(name = "org.unpaused.Controller")]
impl ControllerInterface {
   async fn headset_plug(&self, state: i32, initial: bool) -> zbus::fdo::Result<()> {
      self.surface.forward(headset_event(state, initial))
   }

   async fn bluetooth_connection_state(&self, state: i32) -> zbus::fdo::Result<()> {
      let state = ConnectionState::from_repr(state).ok_or_else(|| {
         zbus::fdo::Error::InvalidArgs(format!("Invalid connection state: {state}"))
      })?;
      self
         .surface
         .forward(AudioEvent::BluetoothConnectionState(state))
   }

   async fn becoming_noisy(&self) -> zbus::fdo::Result<()> {
      self.surface.forward(AudioEvent::BecomingNoisy)
   }

   async fn get_status(&self) -> zbus::fdo::Result<String> {
      serde_json::to_string(&self.surface.status())
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   // Signals
   #[zbus(signal)]
   pub async fn playback_paused(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn playback_resumed(
      emitter: &SignalEmitter<'_>,
      source: &str,
      haptic: bool,
   ) -> zbus::Result<()>;
}
