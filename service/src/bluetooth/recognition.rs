//! Recognition of Bluetooth audio output devices.
//!
//! A device counts as an audio sink when it advertises one of the audio
//! output profiles, or when its class of device says Audio/Video.

use std::collections::HashSet;

use uuid::Uuid;

/// Major device class for Audio/Video devices
const MAJOR_CLASS_AUDIO_VIDEO: u32 = 0x04;

/// Profiles that route playback to the device
static AUDIO_SINK_SERVICES: [Uuid; 4] = [
   Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb), // A2DP sink
   Uuid::from_u128(0x00001108_0000_1000_8000_00805f9b34fb), // Headset
   Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb), // Handsfree
   Uuid::from_u128(0x00001131_0000_1000_8000_00805f9b34fb), // Headset (HS)
];

/// Checks the major class bits (8..=12) of a class-of-device value
pub const fn is_audio_class(class: u32) -> bool {
   (class >> 8) & 0x1f == MAJOR_CLASS_AUDIO_VIDEO
}

pub fn has_audio_service(uuids: &HashSet<Uuid>) -> bool {
   uuids.iter().any(|u| AUDIO_SINK_SERVICES.contains(u))
}

pub async fn is_audio_sink(dev: &bluer::Device) -> bool {
   // 1. Service UUIDs, present for any paired device
   if let Ok(Some(uuids)) = dev.uuids().await
      && has_audio_service(&uuids)
   {
      log::debug!("{} is an audio sink via service UUID", dev.address());
      return true;
   }

   // 2. Class of device, for devices that hide their services
   if let Ok(Some(class)) = dev.class().await
      && is_audio_class(class)
   {
      log::debug!("{} is an audio sink via class {class:#08x}", dev.address());
      return true;
   }
   false
}
