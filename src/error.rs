//! Error taxonomy (spec §7). The protocol core never throws across a
//! component boundary — every fallible operation returns one of these.

use thiserror::Error;

use crate::topic::Topic;

/// Kinds of error the core can produce. Callers that need to notify the
/// server convert the eligible variants into an `ExceptionEncountered`
/// event via [`crate::managers::exception::ExceptionManager`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed message on {topic:?} seq={sequence} index={index}: {detail}")]
    MalformedMessage {
        topic: Topic,
        sequence: u32,
        index: u32,
        detail: String,
    },

    #[error("no handler registered for directive {name:?} (seq={sequence} index={index})")]
    UnsupportedApi {
        name: String,
        sequence: u32,
        index: u32,
    },

    #[error("secret rotation failed: {0}")]
    RotationFailure(String),

    #[error("encryption/decryption failed on {topic:?} seq={sequence}: {detail}")]
    CryptoFailure {
        topic: Topic,
        sequence: u32,
        detail: String,
    },

    #[error("chunk of {size} bytes exceeds max_message_size {max}")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("sequencer has no room for a message {delta} ahead of next_expected")]
    SequencerFull { delta: u32 },

    #[error("ring overrun: reader fell behind the writer by more than the buffer holds")]
    RingOverrun,

    #[error("ring operation would block")]
    RingWouldBlock,

    #[error("ring reader or writer handle is closed")]
    RingClosed,

    #[error("invalid ring operation: {0}")]
    RingInvalid(String),

    #[error("MQTT publish failed: {0}")]
    PublishFailure(String),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Maps to the `ExceptionEncountered.error.code` enumeration (spec §6).
    pub fn exception_code(&self) -> &'static str {
        match self {
            CoreError::MalformedMessage { .. } => "MALFORMED_MESSAGE",
            CoreError::UnsupportedApi { .. } => "UNSUPPORTED_API",
            CoreError::RotationFailure(_) => "INTERNAL_ERROR",
            CoreError::CryptoFailure { .. } => "INTERNAL_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}
