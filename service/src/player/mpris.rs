//! MPRIS player backend.
//!
//! Tracks every `org.mpris.MediaPlayer2.*` name on the session bus and its
//! playback status, picks the player to control, and forwards pause/resume
//! commands to it from an actor task so callers never block.

use std::{collections::HashMap, sync::Arc};

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::RwLock;
use smol_str::SmolStr;
use tokio::{select, sync::mpsc, task::JoinHandle};
use zbus::{Connection, fdo, proxy};

use crate::{
   config::Config,
   error::Result,
   player::{MediaPlayer, PlayerStatus},
};

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
/// Command inbox size
const INBOX_SIZE: usize = 32;

#[proxy(
   interface = "org.mpris.MediaPlayer2",
   default_service = "org.mpris.MediaPlayer2",
   default_path = "/org/mpris/MediaPlayer2"
)]
trait MediaPlayer2 {
   #[zbus(property)]
   fn identity(&self) -> zbus::Result<String>;
}

#[proxy(
   interface = "org.mpris.MediaPlayer2.Player",
   default_service = "org.mpris.MediaPlayer2",
   default_path = "/org/mpris/MediaPlayer2"
)]
trait MediaPlayer2Player {
   fn play(&self) -> zbus::Result<()>;

   fn pause(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn playback_status(&self) -> zbus::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedPlayer {
   identity: SmolStr,
   status: PlayerStatus,
}

/// Players currently on the bus, keyed by bus name.
#[derive(Debug, Default)]
struct PlayerTable {
   players: HashMap<SmolStr, TrackedPlayer>,
   /// Player that most recently started playing.
   last_active: Option<SmolStr>,
}

impl PlayerTable {
   fn insert(&mut self, bus_name: SmolStr, identity: SmolStr, status: PlayerStatus) {
      self.players.insert(bus_name.clone(), TrackedPlayer { identity, status });
      self.set_status(&bus_name, status);
   }

   fn set_status(&mut self, bus_name: &SmolStr, status: PlayerStatus) {
      let Some(player) = self.players.get_mut(bus_name) else {
         return;
      };
      player.status = status;
      if status == PlayerStatus::Playing {
         self.last_active = Some(bus_name.clone());
      }
   }

   /// Forgets a player. If it was the default target, another player that
   /// is still playing takes its place.
   fn remove(&mut self, bus_name: &str) {
      self.players.remove(bus_name);
      if self.last_active.as_deref() == Some(bus_name) {
         self.last_active = self
            .players
            .iter()
            .find(|(_, p)| p.status == PlayerStatus::Playing)
            .map(|(name, _)| name.clone());
      }
   }

   /// Resolves the player to control.
   ///
   /// A configured player wins when present; otherwise the last one to start
   /// playing.
   fn target(&self, preferred: Option<&str>) -> Option<(&SmolStr, &TrackedPlayer)> {
      if let Some(preferred) = preferred {
         return self
            .players
            .iter()
            .find(|(name, player)| matches_player(name, &player.identity, preferred));
      }
      let name = self.last_active.as_ref()?;
      self.players.get_key_value(name)
   }

   /// True when any player other than `target` is playing.
   fn other_playing(&self, target: Option<&str>) -> bool {
      self
         .players
         .iter()
         .any(|(name, p)| Some(name.as_str()) != target && p.status == PlayerStatus::Playing)
   }
}

/// Matches `wanted` against a bus name suffix (with or without an instance
/// part) or a player identity.
fn matches_player(bus_name: &str, identity: &str, wanted: &str) -> bool {
   let suffix = bus_name.strip_prefix(MPRIS_PREFIX).unwrap_or(bus_name);
   let app = suffix.split('.').next().unwrap_or(suffix);
   suffix.eq_ignore_ascii_case(wanted)
      || app.eq_ignore_ascii_case(wanted)
      || identity.eq_ignore_ascii_case(wanted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerCommand {
   Play,
   Pause,
}

struct Shared {
   table: RwLock<PlayerTable>,
   config: Config,
}

impl Shared {
   fn new(config: Config) -> Self {
      Self {
         table: RwLock::new(PlayerTable::default()),
         config,
      }
   }

   fn target_name(&self) -> Option<SmolStr> {
      let table = self.table.read();
      table
         .target(self.config.player.as_deref())
         .map(|(name, _)| name.clone())
   }

   fn player_status(&self) -> PlayerStatus {
      let table = self.table.read();
      table
         .target(self.config.player.as_deref())
         .map(|(_, p)| p.status)
         .unwrap_or_default()
   }

   fn is_audio_channel_in_use(&self) -> bool {
      let table = self.table.read();
      let target = table
         .target(self.config.player.as_deref())
         .map(|(name, _)| name.as_str());
      table.other_playing(target)
   }

   fn is_casting(&self) -> bool {
      let table = self.table.read();
      table
         .target(self.config.player.as_deref())
         .is_some_and(|(_, p)| self.config.is_remote_player(&p.identity))
   }
}

/// [`MediaPlayer`] implementation speaking MPRIS over D-Bus.
pub struct MprisPlayer {
   shared: Arc<Shared>,
   inbox: mpsc::Sender<PlayerCommand>,
}

impl MprisPlayer {
   /// Discovers the players on `connection` and starts following them.
   pub async fn new(connection: Connection, config: Config) -> Result<Self> {
      let dbus = fdo::DBusProxy::new(&connection).await?;
      let name_changes = dbus.receive_name_owner_changed().await?;

      let shared = Arc::new(Shared::new(config));
      let (tx, rx) = mpsc::channel(INBOX_SIZE);
      let mut actor = PlayerActor {
         connection,
         shared: shared.clone(),
         commands: rx,
         watchers: HashMap::new(),
      };

      for name in dbus.list_names().await? {
         if name.as_str().starts_with(MPRIS_PREFIX) {
            actor.watch(SmolStr::from(name.as_str()));
         }
      }
      info!("Tracking {} MPRIS player(s)", actor.watchers.len());

      tokio::spawn(actor.run(name_changes));
      Ok(Self { shared, inbox: tx })
   }

   fn send(&self, cmd: PlayerCommand) {
      if let Err(e) = self.inbox.try_send(cmd) {
         warn!("Dropping player command {cmd:?}: {e}");
      }
   }
}

impl MediaPlayer for MprisPlayer {
   fn player_status(&self) -> PlayerStatus {
      self.shared.player_status()
   }

   fn pause(&self, suppress_notification: bool, reinit: bool) {
      // MPRIS has no notion of notifications or media reloads
      debug!("Pause requested (suppress_notification={suppress_notification}, reinit={reinit})");
      self.send(PlayerCommand::Pause);
   }

   fn resume(&self) {
      self.send(PlayerCommand::Play);
   }

   fn is_audio_channel_in_use(&self) -> bool {
      self.shared.is_audio_channel_in_use()
   }

   fn is_casting(&self) -> bool {
      self.shared.is_casting()
   }
}

struct PlayerActor {
   connection: Connection,
   shared: Arc<Shared>,
   commands: mpsc::Receiver<PlayerCommand>,
   watchers: HashMap<SmolStr, JoinHandle<()>>,
}

impl PlayerActor {
   async fn run(mut self, mut name_changes: impl Stream<Item = fdo::NameOwnerChanged> + Unpin) {
      loop {
         select! {
            cmd = self.commands.recv() => {
               let Some(cmd) = cmd else {
                  debug!("Player backend shutting down");
                  break;
               };
               self.execute(cmd).await;
            }
            signal = name_changes.next() => {
               let Some(signal) = signal else {
                  warn!("Lost D-Bus name owner updates");
                  break;
               };
               let Ok(args) = signal.args() else {
                  continue;
               };
               if !args.name().starts_with(MPRIS_PREFIX) {
                  continue;
               }
               let name = SmolStr::from(args.name().as_str());
               match (args.old_owner().as_deref(), args.new_owner().as_deref()) {
                  (Some(_), None) => self.unwatch(&name),
                  (None, Some(_)) => self.watch(name),
                  _ => {},
               }
            }
         }
      }

      for (_, handle) in self.watchers.drain() {
         handle.abort();
      }
   }

   async fn execute(&self, cmd: PlayerCommand) {
      let Some(name) = self.shared.target_name() else {
         debug!("No player to {cmd:?}");
         return;
      };

      let result = async {
         let proxy = MediaPlayer2PlayerProxy::builder(&self.connection)
            .destination(name.to_string())?
            .build()
            .await?;
         match cmd {
            PlayerCommand::Play => proxy.play().await,
            PlayerCommand::Pause => proxy.pause().await,
         }
      }
      .await;

      match result {
         Ok(()) => info!("Sent {cmd:?} to {name}"),
         Err(e) => warn!("Failed to send {cmd:?} to {name}: {e}"),
      }
   }

   fn watch(&mut self, name: SmolStr) {
      if self.watchers.contains_key(&name) {
         return;
      }
      debug!("Watching player {name}");
      let handle = tokio::spawn(watch_player(
         self.connection.clone(),
         self.shared.clone(),
         name.clone(),
      ));
      self.watchers.insert(name, handle);
   }

   fn unwatch(&mut self, name: &SmolStr) {
      debug!("Player {name} left the bus");
      if let Some(handle) = self.watchers.remove(name) {
         handle.abort();
      }
      self.shared.table.write().remove(name);
   }
}

async fn watch_player(connection: Connection, shared: Arc<Shared>, name: SmolStr) {
   if let Err(e) = follow_status(&connection, &shared, &name).await {
      warn!("Stopped following player {name}: {e}");
   }
}

async fn follow_status(
   connection: &Connection,
   shared: &Shared,
   name: &SmolStr,
) -> zbus::Result<()> {
   let base = MediaPlayer2Proxy::builder(connection)
      .destination(name.to_string())?
      .build()
      .await?;
   let identity = base
      .identity()
      .await
      .map_or_else(|_| name.clone(), SmolStr::from);

   let player = MediaPlayer2PlayerProxy::builder(connection)
      .destination(name.to_string())?
      .build()
      .await?;
   let mut changes = player.receive_playback_status_changed().await;
   let status = player
      .playback_status()
      .await
      .map(|s| PlayerStatus::from_mpris(&s))
      .unwrap_or_default();

   info!("Found player {identity} ({name}), {status}");
   shared.table.write().insert(name.clone(), identity, status);

   while let Some(change) = changes.next().await {
      if let Ok(status) = change.get().await {
         let status = PlayerStatus::from_mpris(&status);
         debug!("Player {name} is now {status}");
         shared.table.write().set_status(name, status);
      }
   }
   Ok(())
}
