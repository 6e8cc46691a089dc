//! Media Module - lokale Kamera, Mikrofon und Bildschirm
//!
//! Dieses Modul verwaltet:
//! - Beschaffung und Freigabe der lokalen Tracks
//! - Stummschalten ohne Neuverhandlung
//! - Bildschirmfreigabe mit geparkter Kamera
//! - Mikrofon-Capture über cpal (PCMU)

mod audio;
mod controller;
mod devices;
mod track;

pub use audio::{AudioError, CAPTURE_RATE, FRAME_SAMPLES};
pub use controller::{LocalMediaHandle, MediaController, MediaError};
pub use devices::{MediaDevices, SystemDevices};
pub use track::{LocalTrack, MediaFrame, TrackCodec, TrackKind, TrackSource};
