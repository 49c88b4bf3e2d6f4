use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, util::check_dimension};

/// Upper bound on `states * actions` for a single table
pub const MAX_ENTRIES: usize = 1 << 24;

/// How the entries of a fresh [`QTable`] are filled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TableInit {
    Zeros,
    /// Uniform in `[0, scale)`, which breaks ties between untried actions at random
    Random { scale: f64 },
}

impl Default for TableInit {
    fn default() -> Self {
        Self::Random { scale: 0.01 }
    }
}

/// Dense action-value table indexed `[state][action]`
///
/// Every entry is initialized at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTable")]
pub struct QTable {
    states: usize,
    actions: usize,
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct RawTable {
    states: usize,
    actions: usize,
    values: Vec<f64>,
}

impl TryFrom<RawTable> for QTable {
    type Error = String;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        let len = checked_len(raw.states, raw.actions).map_err(|e| e.to_string())?;
        if raw.values.len() != len {
            return Err(format!(
                "expected {} values for a {}x{} table, found {}",
                len,
                raw.states,
                raw.actions,
                raw.values.len()
            ));
        }
        Ok(Self {
            states: raw.states,
            actions: raw.actions,
            values: raw.values,
        })
    }
}

/// Number of entries of a `states` x `actions` table, if it is allowed to exist
fn checked_len(states: usize, actions: usize) -> Result<usize, ConfigError> {
    check_dimension("states", states)?;
    check_dimension("actions", actions)?;
    states
        .checked_mul(actions)
        .filter(|&len| len <= MAX_ENTRIES)
        .ok_or(ConfigError::TableTooLarge {
            states,
            actions,
            max: MAX_ENTRIES,
        })
}

impl QTable {
    pub fn new<R: Rng + ?Sized>(
        states: usize,
        actions: usize,
        init: TableInit,
        rng: &mut R,
    ) -> Result<Self, ConfigError> {
        let len = checked_len(states, actions)?;
        let values = match init {
            TableInit::Zeros => vec![0.0; len],
            TableInit::Random { scale } => (0..len).map(|_| rng.gen::<f64>() * scale).collect(),
        };
        Ok(Self {
            states,
            actions,
            values,
        })
    }

    /// Build a table from explicit rows, which must all have the same non-zero length
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ConfigError> {
        check_dimension("states", rows.len())?;
        let actions = rows[0].len();
        checked_len(rows.len(), actions)?;
        if let Some(row) = rows.iter().find(|r| r.len() != actions) {
            return Err(ConfigError::ActionSpaceMismatch {
                expected: actions,
                actual: row.len(),
            });
        }
        Ok(Self {
            states: rows.len(),
            actions,
            values: rows.into_iter().flatten().collect(),
        })
    }

    pub fn num_states(&self) -> usize {
        self.states
    }

    pub fn num_actions(&self) -> usize {
        self.actions
    }

    /// The values of every action in a state
    ///
    /// **Panics** if `state` is outside `[0, num_states)`
    pub fn row(&self, state: usize) -> &[f64] {
        assert!(
            state < self.states,
            "State index {state} is outside the table (0..{})",
            self.states
        );
        &self.values[state * self.actions..(state + 1) * self.actions]
    }

    /// Like [`row`](Self::row), but fails instead of panicking on a bad index
    pub fn try_row(&self, state: usize) -> Result<&[f64], ConfigError> {
        if state < self.states {
            Ok(self.row(state))
        } else {
            Err(ConfigError::StateOutOfRange {
                index: state,
                states: self.states,
            })
        }
    }

    pub fn get(&self, state: usize, action: usize) -> f64 {
        self.row(state)[action]
    }

    pub(crate) fn set(&mut self, state: usize, action: usize, value: f64) {
        assert!(
            state < self.states && action < self.actions,
            "Entry ({state}, {action}) is outside the {}x{} table",
            self.states,
            self.actions
        );
        self.values[state * self.actions + action] = value;
    }

    /// The best action in a state and its value
    ///
    /// Scans from action 0 and only replaces the incumbent on a strictly greater
    /// value, so ties go to the lowest action index.
    pub fn best_action_value(&self, state: usize) -> (usize, f64) {
        let row = self.row(state);
        let mut best = (0, row[0]);
        for (action, &value) in row.iter().enumerate().skip(1) {
            if value > best.1 {
                best = (action, value);
            }
        }
        best
    }

    /// Like [`best_action_value`](Self::best_action_value), restricted to some actions
    ///
    /// Ties go to the candidate listed first. **Returns** `None` if `candidates` is empty.
    pub fn best_among(&self, state: usize, candidates: &[usize]) -> Option<(usize, f64)> {
        let row = self.row(state);
        let (&first, rest) = candidates.split_first()?;
        let mut best = (first, row[first]);
        for &action in rest {
            if row[action] > best.1 {
                best = (action, row[action]);
            }
        }
        Some(best)
    }
}
