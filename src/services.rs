//! Dependency-injection bundle: the core takes its RNG, clock, crypto, and
//! secret persistence through trait objects rather than process globals
//! (spec §9 design notes).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::crypto::{Aes256GcmProvider, CryptoProvider};
use crate::error::CoreError;

/// Wall-clock abstraction so clock-sync logic is testable without sleeping.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch, per the device's own clock.
    fn now_millis(&self) -> u64;
}

/// The production clock, backed by `SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Persists the rotating shared secret across restarts (spec §6 "persisted
/// state"). The registration exchange that first obtains the secret is out
/// of scope; this trait only covers load/save of whatever bytes it hands
/// the core.
pub trait SecretStore: Send + Sync {
    fn load(&self) -> Result<Option<Vec<u8>>, CoreError>;
    fn save(&self, secret: &[u8]) -> Result<(), CoreError>;
}

/// An in-memory `SecretStore`, suitable for tests and as a default before a
/// persistent-storage backend (e.g. a platform keystore) is wired in.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    inner: Mutex<Option<Vec<u8>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(secret: Vec<u8>) -> Self {
        InMemorySecretStore { inner: Mutex::new(Some(secret)) }
    }
}

impl SecretStore for InMemorySecretStore {
    fn load(&self) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, secret: &[u8]) -> Result<(), CoreError> {
        *self.inner.lock() = Some(secret.to_vec());
        Ok(())
    }
}

/// Generates the 8-character message identifiers used on every JSON
/// message (spec §3). Kept behind a trait so tests can supply deterministic
/// ids; production uses the thread-local CSPRNG via [`StdRng::from_entropy`].
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> crate::message::MessageId;
}

pub struct RandomIdGenerator {
    rng: Mutex<StdRng>,
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        RandomIdGenerator { rng: Mutex::new(StdRng::from_entropy()) }
    }
}

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> crate::message::MessageId {
        let mut rng = self.rng.lock();
        crate::message::MessageId::generate(&mut *rng)
    }
}

/// The bundle of injected dependencies threaded through the whole core,
/// replacing the process-global singletons a naive port would reach for.
#[derive(Clone)]
pub struct Services {
    pub crypto: Arc<dyn CryptoProvider>,
    pub clock: Arc<dyn Clock>,
    pub secrets: Arc<dyn SecretStore>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Services {
    pub fn production() -> Self {
        Services {
            crypto: Arc::new(Aes256GcmProvider::new()),
            clock: Arc::new(SystemClock),
            secrets: Arc::new(InMemorySecretStore::new()),
            ids: Arc::new(RandomIdGenerator::default()),
        }
    }

    /// A random `u32` in `[0, bound)`, used for jitter and test scaffolding.
    pub fn random_below(&self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_secret_store_round_trips() {
        let store = InMemorySecretStore::new();
        assert_eq!(store.load().unwrap(), None);
        store.save(b"topsecret").unwrap();
        assert_eq!(store.load().unwrap(), Some(b"topsecret".to_vec()));
    }

    #[test]
    fn random_id_generator_produces_valid_ids() {
        let gen = RandomIdGenerator::default();
        let id = gen.next_id();
        assert_eq!(id.as_str().len(), crate::message::MessageId::LEN);
    }
}
