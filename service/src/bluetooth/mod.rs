//! Bluetooth audio output tracking.
//!
//! This module watches BlueZ for audio devices connecting and disconnecting
//! and turns those transitions into audio events.

pub mod monitor;
pub mod recognition;
