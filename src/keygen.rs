//! Key selection policies and value-buffer generation.
//!
//! Every worker owns one [`KeyGen`] and one value buffer. Key generation is
//! pure per call apart from the worker-local counter, so workers never
//! contend on shared state in the hot loop.

use rand::rngs::SmallRng;
use rand::{Rng as _, SeedableRng as _};

/// How the key for each operation is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPolicy {
    /// `key:<worker_id>:<local_counter>` — every worker writes its own range.
    PerWorker,
    /// Uniform pick from `[offset, offset + keyspace)`, key = `key:<n>`.
    Random { keyspace: u64, offset: u64 },
    /// `key:<(local_counter mod keyspace) + offset>`. With `random_start`
    /// each worker begins at a random counter so load spreads across shards.
    Sequential {
        keyspace: u64,
        offset: u64,
        random_start: bool,
    },
}

/// Per-worker key generator.
pub struct KeyGen {
    policy: KeyPolicy,
    worker_id: usize,
    counter: u64,
    rng: SmallRng,
}

impl KeyGen {
    pub fn new(policy: KeyPolicy, worker_id: usize) -> Self {
        Self::with_rng(policy, worker_id, SmallRng::from_os_rng())
    }

    fn with_rng(policy: KeyPolicy, worker_id: usize, mut rng: SmallRng) -> Self {
        let counter = match &policy {
            KeyPolicy::Sequential {
                keyspace,
                random_start: true,
                ..
            } if *keyspace > 0 => rng.random_range(0..*keyspace),
            _ => 0,
        };
        Self {
            policy,
            worker_id,
            counter,
            rng,
        }
    }

    /// Produce the key for the next operation and advance the local counter.
    pub fn next_key(&mut self) -> String {
        let key = match &self.policy {
            KeyPolicy::PerWorker => format!("key:{}:{}", self.worker_id, self.counter),
            KeyPolicy::Random { keyspace, offset } => {
                let n = offset + self.rng.random_range(0..*keyspace);
                format!("key:{n}")
            }
            KeyPolicy::Sequential {
                keyspace, offset, ..
            } => format!("key:{}", (self.counter % keyspace) + offset),
        };
        self.counter = self.counter.wrapping_add(1);
        key
    }
}

/// Linear-congruential generator matching the original value filler.
struct Lcg(u32);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        self.0
    }
}

/// Fill a value buffer of `size` bytes with characters from `A..=Z`.
///
/// Workers call this once and reuse the buffer across calls.
pub fn generate_value(size: usize, seed: u32) -> Vec<u8> {
    let mut state = Lcg(seed);
    (0..size)
        .map(|_| b'A' + ((state.next() >> 16) % 26) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(policy: KeyPolicy, worker_id: usize, seed: u64) -> KeyGen {
        KeyGen::with_rng(policy, worker_id, SmallRng::seed_from_u64(seed))
    }

    #[test]
    fn per_worker_keys_embed_worker_and_counter() {
        let mut generator = seeded(KeyPolicy::PerWorker, 3, 1);
        assert_eq!(generator.next_key(), "key:3:0");
        assert_eq!(generator.next_key(), "key:3:1");
        assert_eq!(generator.next_key(), "key:3:2");
    }

    #[test]
    fn random_keys_stay_within_offset_keyspace() {
        let mut generator = seeded(
            KeyPolicy::Random {
                keyspace: 100,
                offset: 1000,
            },
            0,
            2,
        );
        for _ in 0..1000 {
            let key = generator.next_key();
            let n: u64 = key.strip_prefix("key:").unwrap().parse().unwrap();
            assert!((1000..1100).contains(&n), "{key} out of range");
        }
    }

    #[test]
    fn sequential_keys_wrap_modulo_keyspace() {
        let mut generator = seeded(
            KeyPolicy::Sequential {
                keyspace: 3,
                offset: 10,
                random_start: false,
            },
            0,
            3,
        );
        let keys: Vec<String> = (0..7).map(|_| generator.next_key()).collect();
        assert_eq!(
            keys,
            ["key:10", "key:11", "key:12", "key:10", "key:11", "key:12", "key:10"]
        );
    }

    #[test]
    fn sequential_random_start_begins_inside_keyspace() {
        let mut generator = seeded(
            KeyPolicy::Sequential {
                keyspace: 50,
                offset: 0,
                random_start: true,
            },
            0,
            4,
        );
        let first: u64 = generator
            .next_key()
            .strip_prefix("key:")
            .unwrap()
            .parse()
            .unwrap();
        assert!(first < 50);
    }

    #[test]
    fn value_buffer_is_uppercase_and_deterministic() {
        let a = generate_value(64, 1234);
        let b = generate_value(64, 1234);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.iter().all(|c| c.is_ascii_uppercase()));
        assert_ne!(a, generate_value(64, 4321));
    }

    #[test]
    fn value_buffer_handles_zero_size() {
        assert!(generate_value(0, 1234).is_empty());
    }
}
