//! Haptic feedback for automatic resumes.
//!
//! On Linux phones vibration is owned by feedbackd. The daemon triggers a
//! configured feedbackd event and ends it after the requested duration, which
//! yields a pulse of roughly that length. Desktops without feedbackd fall back
//! to [`NullHaptics`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::{sync::mpsc, time};
use zbus::{Connection, proxy, zvariant::Value};

use crate::error::Result;

const APP_ID: &str = "org.unpaused";
/// Inbox size; pulses beyond this are dropped
const INBOX_SIZE: usize = 8;

/// Device vibration.
pub trait Haptics: Send + Sync {
   /// Vibrates for `duration`. Never blocks.
   fn vibrate(&self, duration: Duration);
}

/// Type alias for a shared haptics handle.
pub type HapticsHandle = Arc<dyn Haptics>;

#[proxy(
   interface = "org.sigxcpu.Feedback",
   default_service = "org.sigxcpu.Feedback",
   default_path = "/org/sigxcpu/Feedback"
)]
trait Feedback {
   fn trigger_feedback(
      &self,
      app_id: &str,
      event: &str,
      hints: &HashMap<&str, &Value<'_>>,
      timeout: i32,
   ) -> zbus::Result<u32>;

   fn end_feedback(&self, id: u32) -> zbus::Result<()>;
}

/// Haptics backed by feedbackd.
pub struct FeedbackdHaptics {
   inbox: mpsc::Sender<Duration>,
}

impl FeedbackdHaptics {
   /// Connects to feedbackd on `connection` and starts the pulse actor.
   ///
   /// Fails if feedbackd is not running.
   pub async fn new(connection: &Connection, event: String) -> Result<Self> {
      let proxy = FeedbackProxy::new(connection).await?;
      // Probe the service so a missing daemon is reported up front.
      proxy.inner().introspect().await?;

      let (tx, rx) = mpsc::channel(INBOX_SIZE);
      tokio::spawn(run_pulses(proxy, event, rx));
      info!("Haptic feedback available through feedbackd");
      Ok(Self { inbox: tx })
   }
}

impl Haptics for FeedbackdHaptics {
   fn vibrate(&self, duration: Duration) {
      if let Err(e) = self.inbox.try_send(duration) {
         warn!("Dropping haptic pulse: {e}");
      }
   }
}

async fn run_pulses(
   proxy: FeedbackProxy<'static>,
   event: String,
   mut rx: mpsc::Receiver<Duration>,
) {
   while let Some(duration) = rx.recv().await {
      let id = match proxy
         .trigger_feedback(APP_ID, &event, &HashMap::new(), -1)
         .await
      {
         Ok(id) => id,
         Err(e) => {
            warn!("Failed to trigger feedback '{event}': {e}");
            continue;
         },
      };

      time::sleep(duration).await;
      if let Err(e) = proxy.end_feedback(id).await {
         debug!("Failed to end feedback {id}: {e}");
      }
   }
   debug!("Haptics actor shutting down");
}

/// Haptics for hosts without a vibration motor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHaptics;

impl Haptics for NullHaptics {
   fn vibrate(&self, duration: Duration) {
      debug!("No haptics available, skipping {duration:?} pulse");
   }
}
