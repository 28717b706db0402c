//! BlueZ monitor for Bluetooth audio devices.
//!
//! Follows every adapter, keeps the connection state of each known audio sink
//! and reports transitions as audio events. A sink connecting yields
//! `BluetoothConnectionState(Connected)`. A sink going away yields
//! `BluetoothConnectionState(Disconnected)` followed by `BecomingNoisy`, since
//! playback is about to fall back to the speakers.

use std::{
   collections::{HashMap, HashSet},
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::mpsc,
   task::{AbortHandle, JoinSet},
   time::{self, MissedTickBehavior},
};

use crate::{
   bluetooth::recognition,
   error::{Result, UnpauseError},
   event::{AudioEvent, ConnectionState, EventSender, EventSource, Subscription},
};

/// Interval to check for new adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Maximum adapter recovery delay
const MAX_RECOVERY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

const CONNECTED_EVENTS: &[AudioEvent] =
   &[AudioEvent::BluetoothConnectionState(ConnectionState::Connected)];
const DISCONNECTED_EVENTS: &[AudioEvent] = &[
   AudioEvent::BluetoothConnectionState(ConnectionState::Disconnected),
   AudioEvent::BecomingNoisy,
];

/// Events to emit when a sink goes from `was_connected` to `is_connected`.
fn transition_events(was_connected: bool, is_connected: bool) -> &'static [AudioEvent] {
   match (was_connected, is_connected) {
      (false, true) => CONNECTED_EVENTS,
      (true, false) => DISCONNECTED_EVENTS,
      _ => &[],
   }
}

/// Event source for Bluetooth audio sinks.
pub struct BluetoothMonitor {
   session: Session,
   poll_interval: Duration,
}

impl BluetoothMonitor {
   pub async fn new(poll_interval: Duration) -> Result<Self> {
      let session = Session::new().await?;
      Ok(Self {
         session,
         poll_interval,
      })
   }
}

impl EventSource for BluetoothMonitor {
   fn subscribe(&self, sink: EventSender) -> Result<Subscription> {
      if self.poll_interval.is_zero() {
         return Err(UnpauseError::InvalidConfig(
            "bluetooth_poll_interval_sec must be positive",
         ));
      }
      let actor = MonitorActor::new(self.session.clone(), sink, self.poll_interval);
      Ok(Subscription::new("bluetooth").with_task(tokio::spawn(actor.run())))
   }
}

// === Actor ===

#[derive(Debug, Clone, Default, PartialEq)]
enum AdapterState {
   #[default]
   Active,
   /// A recovery attempt is scheduled
   Recovering,
   Failed(String),
}

/// Adapter state plus the number of recoveries since it was last healthy.
#[derive(Debug, Default)]
struct AdapterHealth {
   state: AdapterState,
   retry_count: u32,
}

impl AdapterHealth {
   fn activate(&mut self) {
      self.state = AdapterState::Active;
      self.retry_count = 0;
   }

   /// Marks a recovery as pending and returns the attempt number.
   fn schedule_retry(&mut self) -> u32 {
      self.state = AdapterState::Recovering;
      self.retry_count = self.retry_count.saturating_add(1);
      self.retry_count
   }

   fn fail(&mut self, reason: String) {
      self.state = AdapterState::Failed(reason);
   }

   fn is_active(&self) -> bool {
      self.state == AdapterState::Active
   }
}

/// Whether the periodic adapter check should (re)initialize an adapter.
///
/// Adapters with a recovery pending are left to it.
fn needs_init(health: Option<&AdapterHealth>) -> bool {
   match health {
      None => true,
      Some(health) => matches!(health.state, AdapterState::Failed(_)),
   }
}

struct AdapterInfo {
   adapter: Adapter,
   health: AdapterHealth,
   monitor: Option<AbortHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AudioDevice {
   adapter_name: SmolStr,
   name: SmolStr,
   connected: bool,
}

/// Known audio sinks, plus devices already probed and found not to be one.
#[derive(Debug, Default)]
struct DeviceTable {
   devices: HashMap<Address, AudioDevice>,
   ignored: HashSet<Address>,
}

impl DeviceTable {
   fn is_known(&self, addr: &Address) -> bool {
      self.devices.contains_key(addr) || self.ignored.contains(addr)
   }

   fn ignore(&mut self, addr: Address) {
      self.ignored.insert(addr);
   }

   fn len(&self) -> usize {
      self.devices.len()
   }

   /// Records a device seen at startup. Its state is the baseline, not a
   /// transition.
   fn record(&mut self, addr: Address, device: AudioDevice) {
      self.devices.insert(addr, device);
   }

   /// Tracks a device that showed up while running.
   fn add(&mut self, addr: Address, device: AudioDevice) -> &'static [AudioEvent] {
      let events = transition_events(false, device.connected);
      self.devices.insert(addr, device);
      events
   }

   fn remove(&mut self, addr: &Address) -> &'static [AudioEvent] {
      self.ignored.remove(addr);
      match self.devices.remove(addr) {
         Some(device) => transition_events(device.connected, false),
         None => &[],
      }
   }

   /// Drops every device of `adapter_name`.
   fn remove_adapter(&mut self, adapter_name: &str) -> Vec<(Address, &'static [AudioEvent])> {
      let lost: Vec<Address> = self
         .devices
         .iter()
         .filter(|(_, d)| d.adapter_name.as_str() == adapter_name)
         .map(|(addr, _)| *addr)
         .collect();
      lost
         .into_iter()
         .map(|addr| (addr, self.remove(&addr)))
         .collect()
   }

   fn set_connected(&mut self, addr: &Address, connected: bool) -> &'static [AudioEvent] {
      let Some(device) = self.devices.get_mut(addr) else {
         return &[];
      };
      let was_connected = device.connected;
      device.connected = connected;
      transition_events(was_connected, connected)
   }
}

#[derive(Debug)]
enum MonitorCommand {
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String),
   DeviceAdded(Address, SmolStr),
   DeviceRemoved(Address),
}

struct MonitorActor {
   session: Session,
   sink: EventSender,
   poll_interval: Duration,
   loopback_tx: mpsc::Sender<MonitorCommand>,
   loopback_rx: mpsc::Receiver<MonitorCommand>,
   adapters: HashMap<SmolStr, AdapterInfo>,
   devices: DeviceTable,
   /// Adapter monitors and recovery timers; aborted when the actor goes away
   tasks: JoinSet<()>,
}

impl MonitorActor {
   fn new(session: Session, sink: EventSender, poll_interval: Duration) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         session,
         sink,
         poll_interval,
         loopback_tx,
         loopback_rx,
         adapters: HashMap::new(),
         devices: DeviceTable::default(),
         tasks: JoinSet::new(),
      }
   }

   async fn run(mut self) {
      info!("Bluetooth monitor starting up");

      self.initialize_adapters().await;
      info!("Tracking {} Bluetooth audio device(s)", self.devices.len());

      let mut poll_interval = time::interval(self.poll_interval);
      poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adapter_check_interval = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = poll_interval.tick() => {
               self.check_connections().await;
            }
            _ = adapter_check_interval.tick() => {
               self.discover_new_adapters().await;
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd).await;
            }
            // Reap finished monitor tasks
            Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
         }
      }
   }

   fn emit(&self, addr: Address, events: &[AudioEvent]) {
      for event in events {
         debug!("{addr}: {event:?}");
         self.sink.emit(*event);
      }
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      // If no adapters found, try default
      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      match self.session.adapter(&name) {
         Ok(adapter) => self.activate_adapter(name, adapter).await,
         Err(e) => warn!("Failed to initialize adapter {name}: {e}"),
      }
   }

   /// Powers the adapter on and starts following it. On failure the adapter
   /// is kept with a pending recovery.
   async fn activate_adapter(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Initializing adapter: {name}");

      let powered = match adapter.is_powered().await {
         Ok(true) => Ok(()),
         Ok(false) => adapter.set_powered(true).await.inspect(|_| {
            info!("Powered on adapter: {name}");
         }),
         Err(e) => Err(e),
      };

      let info = self
         .adapters
         .entry(name.clone())
         .or_insert_with(|| AdapterInfo {
            adapter: adapter.clone(),
            health: AdapterHealth::default(),
            monitor: None,
         });
      info.adapter = adapter.clone();
      if let Some(handle) = info.monitor.take() {
         handle.abort();
      }

      if let Err(e) = powered {
         warn!("Failed to power on adapter {name}: {e}");
         let retry_count = info.health.schedule_retry();
         self.schedule_recovery(name, retry_count);
         return;
      }
      info.health.activate();

      let monitor = self.start_adapter_monitor(name.clone(), adapter);
      if let Some(info) = self.adapters.get_mut(&name) {
         info.monitor = Some(monitor);
      }

      // Devices already present are the initial state, not transitions
      self.record_known_devices(&name).await;
   }

   fn start_adapter_monitor(&mut self, name: SmolStr, adapter: Adapter) -> AbortHandle {
      let loopback = self.loopback_tx.clone();
      self.tasks.spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            let _ = loopback
               .send(MonitorCommand::AdapterError(
                  name.clone(),
                  "Failed to get adapter events".to_string(),
               ))
               .await;
            return;
         };

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::DeviceAdded(addr) => {
                  let _ = loopback
                     .send(MonitorCommand::DeviceAdded(addr, name.clone()))
                     .await;
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  let _ = loopback.send(MonitorCommand::DeviceRemoved(addr)).await;
               },
               _ => {},
            }
         }

         // If we exit the event loop, adapter is probably gone
         if let Err(e) = loopback.send(MonitorCommand::AdapterLost(name)).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   async fn record_known_devices(&mut self, adapter_name: &SmolStr) {
      let Some(adapter_info) = self.adapters.get(adapter_name) else {
         return;
      };
      let Ok(addresses) = adapter_info.adapter.device_addresses().await else {
         return;
      };
      let adapter = adapter_info.adapter.clone();

      for addr in addresses {
         if self.devices.is_known(&addr) {
            continue;
         }
         if let Some(device) = probe_device(&adapter, addr, adapter_name).await {
            debug!(
               "Known audio device {} ({addr}), connected={}",
               device.name, device.connected
            );
            self.devices.record(addr, device);
         } else {
            self.devices.ignore(addr);
         }
      }
   }

   async fn handle_command(&mut self, cmd: MonitorCommand) {
      match cmd {
         MonitorCommand::AdapterAvailable(name, adapter) => {
            info!("Adapter available: {name}");
            self.activate_adapter(name, adapter).await;
         },
         MonitorCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         MonitorCommand::AdapterError(name, error) => {
            error!("Adapter error on {name}: {error}");
            if let Some(info) = self.adapters.get_mut(&name) {
               info.health.fail(error);
            }
         },
         MonitorCommand::DeviceAdded(addr, adapter_name) => {
            self.handle_device_added(addr, adapter_name).await;
         },
         MonitorCommand::DeviceRemoved(addr) => {
            let events = self.devices.remove(&addr);
            if !events.is_empty() {
               info!("Audio device removed: {addr}");
            }
            self.emit(addr, events);
         },
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         return;
      };
      if let Some(handle) = info.monitor.take() {
         handle.abort();
      }
      let retry_count = info.health.schedule_retry();

      // Every sink on a lost adapter is gone with it
      for (addr, events) in self.devices.remove_adapter(&name) {
         self.emit(addr, events);
      }

      self.schedule_recovery(name, retry_count);
   }

   fn schedule_recovery(&mut self, name: SmolStr, retry_count: u32) {
      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();
      let delay = calc_retry_delay(retry_count);
      debug!("Retrying adapter {name} in {delay:?}");

      self.tasks.spawn(async move {
         time::sleep(delay).await;

         let cmd = match session.adapter(&name) {
            Ok(adapter) => MonitorCommand::AdapterAvailable(name, adapter),
            Err(e) => MonitorCommand::AdapterError(name, format!("Recovery failed: {e}")),
         };
         let _ = loopback.send(cmd).await;
      });
   }

   async fn handle_device_added(&mut self, addr: Address, adapter_name: SmolStr) {
      if self.devices.is_known(&addr) {
         return;
      }
      let Some(adapter_info) = self.adapters.get(&adapter_name) else {
         return;
      };
      let adapter = adapter_info.adapter.clone();

      let Some(device) = probe_device(&adapter, addr, &adapter_name).await else {
         self.devices.ignore(addr);
         return;
      };
      info!("Audio device added: {} ({addr})", device.name);
      let events = self.devices.add(addr, device);
      self.emit(addr, events);
   }

   async fn check_connections(&mut self) {
      let mut changed = Vec::new();

      for (addr, device) in &self.devices.devices {
         let Some(adapter_info) = self.adapters.get(&device.adapter_name) else {
            continue;
         };
         if !adapter_info.health.is_active() {
            continue;
         }
         let Ok(bluer_device) = adapter_info.adapter.device(*addr) else {
            continue;
         };
         let is_connected = bluer_device.is_connected().await.unwrap_or(false);
         if is_connected != device.connected {
            changed.push((*addr, is_connected));
         }
      }

      for (addr, is_connected) in changed {
         info!(
            "{addr} {}",
            if is_connected { "connected" } else { "disconnected" }
         );
         let events = self.devices.set_connected(&addr, is_connected);
         self.emit(addr, events);
      }

      // Sinks paired after startup show up here if their add event was missed
      let active: Vec<SmolStr> = self
         .adapters
         .iter()
         .filter(|(_, info)| info.health.is_active())
         .map(|(name, _)| name.clone())
         .collect();
      for name in active {
         let Some(info) = self.adapters.get(&name) else {
            continue;
         };
         let Ok(addresses) = info.adapter.device_addresses().await else {
            continue;
         };
         for addr in addresses {
            self.handle_device_added(addr, name.clone()).await;
         }
      }
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if needs_init(self.adapters.get(&name).map(|info| &info.health)) {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }
}

/// Looks up `addr` and returns it as a tracked device if it is an audio sink.
async fn probe_device(
   adapter: &Adapter,
   addr: Address,
   adapter_name: &SmolStr,
) -> Option<AudioDevice> {
   let device = adapter.device(addr).ok()?;
   if !recognition::is_audio_sink(&device).await {
      return None;
   }
   let name = device
      .name()
      .await
      .ok()
      .flatten()
      .unwrap_or_else(|| addr.to_string());
   Some(AudioDevice {
      adapter_name: adapter_name.clone(),
      name: name.into(),
      connected: device.is_connected().await.unwrap_or(false),
   })
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RECOVERY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
