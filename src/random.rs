//! Random test data
//!
//! Entropy is always supplied by the caller: seed it for reproducible tests,
//! or use [`RandomGen::from_entropy`] when any values will do.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::store::CreateAccountParams;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

pub const CURRENCIES: [&str; 3] = ["EUR", "USD", "CAD"];

pub struct RandomGen {
    rng: StdRng,
}

impl RandomGen {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Uniform in `min..=max`
    pub fn int(&mut self, min: i64, max: i64) -> i64 {
        self.rng.gen_range(min..=max)
    }

    pub fn string(&mut self, n: usize) -> String {
        (0..n)
            .map(|_| ALPHABET[self.rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }

    pub fn owner(&mut self) -> String {
        self.string(6)
    }

    pub fn money(&mut self) -> i64 {
        self.int(0, 1000)
    }

    pub fn currency(&mut self) -> &'static str {
        CURRENCIES[self.rng.gen_range(0..CURRENCIES.len())]
    }

    pub fn create_account_params(&mut self) -> CreateAccountParams {
        CreateAccountParams {
            owner: self.owner(),
            balance: self.money(),
            currency: self.currency().to_string(),
        }
    }
}
