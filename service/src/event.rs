//! Audio output events and the plumbing that delivers them.
//!
//! Host event sources (the Bluetooth monitor, the D-Bus control surface)
//! translate whatever they observe into [`AudioEvent`]s and push them into an
//! [`EventBus`]. A single dispatcher drains the bus into the pause controller.

use std::{fmt, sync::Arc};

use tokio::task::JoinHandle;

use crate::error::Result;

/// Wired headset plug state, as carried by a headset-plug event.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum HeadsetState {
   Unplugged = 0,
   Plugged = 1,
}

/// Connection state of a Bluetooth audio profile.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 3,
}

/// Events that can reach the pause controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEvent {
   /// A wired headset was plugged or unplugged.
   ///
   /// `initial` marks the replay of the current state on subscription rather
   /// than a real transition. `state` is the raw payload; `None` when the
   /// sender did not provide one.
   HeadsetPlug { initial: bool, state: Option<i32> },
   /// A Bluetooth audio device changed its connection state.
   BluetoothConnectionState(ConnectionState),
   /// The audio route is about to fall back to the built-in speakers.
   BecomingNoisy,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Queues an event for the controller.
   fn emit(&self, event: AudioEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// A host facility that produces [`AudioEvent`]s once subscribed.
pub trait EventSource {
   /// Starts delivering events into `sink` until the subscription is dropped.
   fn subscribe(&self, sink: EventSender) -> Result<Subscription>;
}

/// Registration of a sink with an event source.
///
/// Dropping the handle unregisters the sink.
pub struct Subscription {
   name: &'static str,
   tasks: Vec<JoinHandle<()>>,
   on_cancel: Option<CancelHook>,
}

type CancelHook = Box<dyn FnOnce() + Send + Sync>;

impl fmt::Debug for Subscription {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Subscription")
         .field("name", &self.name)
         .field("tasks", &self.tasks.len())
         .field("on_cancel", &self.on_cancel.is_some())
         .finish()
   }
}

impl Subscription {
   pub const fn new(name: &'static str) -> Self {
      Self {
         name,
         tasks: Vec::new(),
         on_cancel: None,
      }
   }

   /// Ties a background task to this subscription.
   pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
      self.tasks.push(task);
      self
   }

   /// Runs `hook` when the subscription ends.
   pub fn on_cancel(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
      self.on_cancel = Some(Box::new(hook));
      self
   }

   pub const fn name(&self) -> &'static str {
      self.name
   }

   pub fn is_active(&self) -> bool {
      self.on_cancel.is_some() || self.tasks.iter().any(|t| !t.is_finished())
   }

   /// Unregisters the sink.
   pub fn unsubscribe(mut self) {
      self.cancel();
   }

   fn cancel(&mut self) {
      for task in self.tasks.drain(..) {
         task.abort();
      }
      if let Some(hook) = self.on_cancel.take() {
         hook();
      }
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      if self.is_active() {
         log::debug!("Unsubscribing from {}", self.name());
      }
      self.cancel();
   }
}

#[cfg(test)]
mod tests {
   use std::sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   };

   use super::*;

   #[test]
   fn test_headset_state_from_payload() {
      assert_eq!(HeadsetState::from_repr(0), Some(HeadsetState::Unplugged));
      assert_eq!(HeadsetState::from_repr(1), Some(HeadsetState::Plugged));
      assert_eq!(HeadsetState::from_repr(-1), None);
      assert_eq!(HeadsetState::from_repr(7), None);
   }

   #[test]
   fn test_connection_state_names() {
      assert_eq!(ConnectionState::from_repr(2), Some(ConnectionState::Connected));
      assert_eq!(ConnectionState::from_repr(4), None);
      assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
   }

   #[test]
   fn test_subscription_runs_cancel_hook_once() {
      let cancelled = Arc::new(AtomicBool::new(false));
      let flag = cancelled.clone();
      let sub = Subscription::new("test").on_cancel(move || {
         assert!(!flag.swap(true, Ordering::SeqCst), "hook ran twice");
      });
      assert!(sub.is_active());

      sub.unsubscribe();
      assert!(cancelled.load(Ordering::SeqCst));
   }

   #[tokio::test]
   async fn test_dropping_subscription_aborts_tasks() {
      let task = tokio::spawn(std::future::pending::<()>());
      let sub = Subscription::new("test").with_task(task);
      assert!(sub.is_active());
      assert_eq!(sub.name(), "test");
      drop(sub);
   }
}
