//! Device-side protocol core for a cloud voice-assistant client.
//!
//! This crate implements the five coupled subsystems that make the
//! device's MQTT channel correct, ordered, encrypted, and responsive under
//! loss, reordering, and load: the outbound [`regulator`]/[`emitter`]
//! pipeline, the inbound [`sequencer`], the [`secret_manager`], the
//! lock-free microphone [`ring`], and the [`dispatcher`]. Registration,
//! the MQTT transport itself, cryptographic primitives, Opus decode,
//! platform audio I/O, and persistent storage are all external
//! collaborators reached through traits in [`mqtt`], [`crypto`], and
//! [`services`] — this crate never owns a socket or a hardware handle.

pub mod config;
pub mod crypto;
pub mod device;
pub mod directives;
pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod events;
pub mod managers;
pub mod message;
pub mod modseq;
pub mod mqtt;
pub mod regulator;
pub mod ring;
pub mod secret_manager;
pub mod sequencer;
pub mod services;
pub mod topic;

pub use device::Device;
pub use error::CoreError;
