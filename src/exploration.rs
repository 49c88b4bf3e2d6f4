use rand::Rng;

use crate::{error::ConfigError, util::check_interval};

/// Exploration policy result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Explore,
    Exploit,
}

/// Epsilon greedy exploration policy with a fixed epsilon
///
/// Randomness comes from the caller, so a seeded generator makes runs reproducible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpsilonGreedy {
    epsilon: f64,
}

impl EpsilonGreedy {
    /// Initialize epsilon greedy policy
    ///
    /// Fails if `epsilon` is not in the interval `[0,1]`
    pub fn new(epsilon: f64) -> Result<Self, ConfigError> {
        check_interval!(epsilon, 0.0, 1.0)?;
        Ok(Self { epsilon })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Explore with probability epsilon, exploit otherwise
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Choice {
        if rng.gen::<f64>() < self.epsilon {
            Choice::Explore
        } else {
            Choice::Exploit
        }
    }
}
