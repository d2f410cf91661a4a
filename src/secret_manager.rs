//! Atomic shared-secret rotation at caller-specified sequence boundaries,
//! independently per topic within a direction (spec §4.3, §9 open question:
//! inbound Directive/Speaker rotation boundaries are independent per-topic).

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::CoreError;
use crate::modseq::mod_ge;
use crate::topic::{Direction, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    In,
    Out,
}

impl KeyDirection {
    fn matches(self, direction: Direction) -> bool {
        matches!((self, direction), (KeyDirection::In, Direction::In) | (KeyDirection::Out, Direction::Out))
    }
}

struct StagedRotation {
    new_key: [u8; 32],
    /// Per-topic sequence number at which `new_key` takes over. A topic
    /// absent from this map is unaffected by this rotation.
    boundaries: HashMap<Topic, u32>,
    /// Set once a topic has observed a call at or past its boundary.
    crossed: DashMap<Topic, bool>,
}

impl StagedRotation {
    fn fully_crossed(&self) -> bool {
        self.boundaries.keys().all(|t| *self.crossed.get(t).as_deref().unwrap_or(&false))
    }
}

/// Holds the current shared secret plus, optionally, a staged rotation
/// awaiting per-topic boundary crossings.
pub struct SecretManager {
    current_key: RwLock<[u8; 32]>,
    staged: RwLock<Option<StagedRotation>>,
}

impl SecretManager {
    pub fn new(initial_key: [u8; 32]) -> Self {
        SecretManager { current_key: RwLock::new(initial_key), staged: RwLock::new(None) }
    }

    /// Stages `new_key` to take effect, per topic, at the sequence numbers
    /// in `boundaries`. All topics in `boundaries` must share `direction`.
    /// Fails if a rotation is already staged and not yet fully retired.
    pub fn rotate(&self, direction: KeyDirection, new_key: [u8; 32], boundaries: HashMap<Topic, u32>) -> Result<(), CoreError> {
        for topic in boundaries.keys() {
            if !direction.matches(topic.direction()) {
                return Err(CoreError::RotationFailure(format!("{topic:?} does not match direction {direction:?}")));
            }
        }
        self.stage(new_key, boundaries)
    }

    /// Stages `new_key` across boundaries spanning both directions at once
    /// (spec §6 `RotateSecret`: one directive carries all four topic
    /// boundaries for a single shared secret). The rotation only finalizes
    /// once every boundary in `boundaries`, inbound and outbound alike, has
    /// been crossed.
    pub fn rotate_all(&self, new_key: [u8; 32], boundaries: HashMap<Topic, u32>) -> Result<(), CoreError> {
        self.stage(new_key, boundaries)
    }

    fn stage(&self, new_key: [u8; 32], boundaries: HashMap<Topic, u32>) -> Result<(), CoreError> {
        if boundaries.is_empty() {
            return Err(CoreError::RotationFailure("rotation requires at least one topic boundary".to_string()));
        }
        let mut staged = self.staged.write();
        if staged.is_some() {
            return Err(CoreError::RotationFailure("a rotation is already staged".to_string()));
        }
        let crossed = DashMap::new();
        for topic in boundaries.keys() {
            crossed.insert(*topic, false);
        }
        *staged = Some(StagedRotation { new_key, boundaries, crossed });
        Ok(())
    }

    /// Returns the key that should be used to encrypt/decrypt `topic` at
    /// `sequence`. Crossing a topic's staged boundary for the last time
    /// promotes the staged key to current and clears the rotation.
    pub fn key_for(&self, direction: KeyDirection, topic: Topic, sequence: u32) -> [u8; 32] {
        debug_assert!(direction.matches(topic.direction()));

        let staged_guard = self.staged.read();
        let Some(staged) = staged_guard.as_ref() else {
            return *self.current_key.read();
        };
        let Some(&boundary) = staged.boundaries.get(&topic) else {
            return *self.current_key.read();
        };

        if mod_ge(sequence, boundary) {
            staged.crossed.insert(topic, true);
            let new_key = staged.new_key;
            let fully_crossed = staged.fully_crossed();
            drop(staged_guard);
            if fully_crossed {
                self.finalize_rotation();
            }
            new_key
        } else {
            *self.current_key.read()
        }
    }

    fn finalize_rotation(&self) {
        let mut staged = self.staged.write();
        if let Some(rotation) = staged.as_ref() {
            if rotation.fully_crossed() {
                *self.current_key.write() = rotation.new_key;
                *staged = None;
            }
        }
    }

    pub fn current_key(&self) -> [u8; 32] {
        *self.current_key.read()
    }
}
