//! Capability-specific managers sitting above the protocol core (spec §4.7,
//! §4.8, plus the supplemented clock/alert/ux/exception/capabilities
//! managers needed to round out a complete device).

pub mod alert;
pub mod capabilities;
pub mod clock;
pub mod exception;
pub mod microphone;
pub mod speaker;
pub mod ux;
