// Random source for the shared board.
//
// xoshiro256++ seeded through SplitMix64. Every participant owns one
// `BoardRng`: it mints the ids of units and chat messages (ids are chosen by
// the creator with no coordination, so they only need to be unlikely to
// collide) and it rolls the dice for chat commands like `2d6`.
//
// Participants seed from the wall clock and process id (`from_clock`), which
// is plenty to keep two players from minting the same id. Tests seed with a
// fixed value (`new`) so dice output and ids are reproducible.
//
// No floating point anywhere: dice use rejection sampling over integers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Alphabet for minted ids (lowercase base 36).
const ID_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of a unit id.
pub const UNIT_ID_LEN: usize = 9;

/// xoshiro256++ generator used for ids and dice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoardRng {
    s: [u64; 4],
}

impl BoardRng {
    /// Seed deterministically. Equal seeds give equal streams.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        let mut s = [0u64; 4];
        for word in &mut s {
            *word = splitmix64(&mut sm);
        }
        Self { s }
    }

    /// Seed from the wall clock mixed with the process id.
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let pid = u64::from(std::process::id());
        Self::new(nanos ^ pid.rotate_left(32))
    }

    pub fn next_u64(&mut self) -> u64 {
        let [s0, s1, s2, s3] = self.s;
        let result = s0.wrapping_add(s3).rotate_left(23).wrapping_add(s0);

        let t = s1 << 17;
        let mut n = [s0, s1, s2 ^ s0, s3 ^ s1];
        n[1] ^= n[2];
        n[0] ^= n[3];
        n[2] ^= t;
        n[3] = n[3].rotate_left(45);
        self.s = n;

        result
    }

    /// Uniform integer in `[low, high)` without modulo bias.
    ///
    /// Panics if `low >= high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "range_u64: empty range {low}..{high}");
        let span = high - low;
        if span.is_power_of_two() {
            return low + (self.next_u64() & (span - 1));
        }
        // Values below `floor` would bias the low residues.
        let floor = span.wrapping_neg() % span;
        loop {
            let r = self.next_u64();
            if r >= floor {
                return low + r % span;
            }
        }
    }

    /// Roll one die with `sides` faces: a value in `[1, sides]`.
    ///
    /// Panics if `sides` is zero.
    pub fn roll(&mut self, sides: u32) -> u32 {
        assert!(sides > 0, "roll: a die needs at least one side");
        self.range_u64(1, u64::from(sides) + 1) as u32
    }

    /// A random base-36 token of `len` characters.
    pub fn token(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| char::from(ID_ALPHABET[self.range_u64(0, 36) as usize]))
            .collect()
    }

    /// A fresh unit id.
    pub fn unit_id(&mut self) -> String {
        self.token(UNIT_ID_LEN)
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = BoardRng::new(7);
        let mut b = BoardRng::new(7);
        for _ in 0..500 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = BoardRng::new(1);
        let mut b = BoardRng::new(2);
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn rolls_cover_every_face() {
        let mut rng = BoardRng::new(99);
        let mut seen = [false; 6];
        for _ in 0..2_000 {
            let face = rng.roll(6);
            assert!((1..=6).contains(&face), "face out of range: {face}");
            seen[face as usize - 1] = true;
        }
        assert!(seen.iter().all(|s| *s), "some faces never came up: {seen:?}");
    }

    #[test]
    fn one_sided_die_always_one() {
        let mut rng = BoardRng::new(3);
        for _ in 0..50 {
            assert_eq!(rng.roll(1), 1);
        }
    }

    #[test]
    fn range_stays_in_bounds() {
        let mut rng = BoardRng::new(12);
        for _ in 0..10_000 {
            let v = rng.range_u64(10, 17);
            assert!((10..17).contains(&v));
        }
    }

    #[test]
    fn unit_ids_are_base36() {
        let mut rng = BoardRng::new(5);
        for _ in 0..100 {
            let id = rng.unit_id();
            assert_eq!(id.len(), UNIT_ID_LEN);
            assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)), "bad id {id}");
        }
    }

    #[test]
    fn clock_seeded_generators_differ() {
        let mut a = BoardRng::from_clock();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut b = BoardRng::from_clock();
        assert_ne!(a.unit_id(), b.unit_id());
    }

    #[test]
    fn state_survives_serialization() {
        let mut rng = BoardRng::new(42);
        rng.token(20);
        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: BoardRng = serde_json::from_str(&json).unwrap();
        for _ in 0..20 {
            assert_eq!(rng.roll(20), restored.roll(20));
        }
    }
}
