use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, EnumIter, EnumString, IntoEnumIterator};

use crate::{env::GymEnv, protocol::StepData};

/// Seed of the random source behind slippery moves, restored on every reset
pub const SLIPPERY_SEED: u64 = 3373;

/// Probability that a slippery "up" moves down instead
pub const SLIP_PROBABILITY: f64 = 0.15;

/// Position of the robot, encoded as `{"x": .., "y": ..}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub x: i64,
    pub y: i64,
}

#[derive(EnumIter, EnumString, AsRefStr, Clone, Copy, PartialEq, Eq, Debug)]
#[strum(serialize_all = "lowercase")]
pub enum Move {
    Left,
    Right,
    Up,
    Down,
}

/// A robot dropped in the center of an NxN grid has to reach the corner `(N-1, N-1)`
///
/// Reaching the goal pays 100. Walking off the grid pays -100 and breaks the robot,
/// which is parked at `(N, N)`. Both end the episode; every other move pays 0.
/// When slippery, "up" goes down instead with probability [`SLIP_PROBABILITY`].
pub struct SquareWorld {
    size: i64,
    location: Location,
    slippery: bool,
    rng: StdRng,
    steps: usize,
}

impl SquareWorld {
    /// **Panics** if `size` is zero
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "A square world needs at least one tile");
        let size = size as i64;
        Self {
            size,
            location: Self::center(size),
            slippery: false,
            rng: StdRng::seed_from_u64(SLIPPERY_SEED),
            steps: 0,
        }
    }

    pub fn slippery(mut self, slippery: bool) -> Self {
        self.slippery = slippery;
        self
    }

    fn center(size: i64) -> Location {
        Location {
            x: size / 2,
            y: size / 2,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Steps taken since the last reset
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn goal_achieved(&self) -> bool {
        self.location.x == self.size - 1 && self.location.y == self.size - 1
    }

    pub fn off_the_grid(&self) -> bool {
        let Location { x, y } = self.location;
        !(0..self.size).contains(&x) || !(0..self.size).contains(&y)
    }

    pub fn is_terminal(&self) -> bool {
        self.goal_achieved() || self.off_the_grid()
    }

    fn apply(&mut self, mv: Move) {
        match mv {
            Move::Left => self.location.x -= 1,
            Move::Right => self.location.x += 1,
            Move::Down => self.location.y -= 1,
            Move::Up if self.slippery && self.rng.gen::<f64>() <= SLIP_PROBABILITY => {
                self.location.y -= 1
            }
            Move::Up => self.location.y += 1,
        }
    }
}

impl GymEnv for SquareWorld {
    type Observation = Location;

    fn action_space(&self) -> Vec<String> {
        Move::iter().map(|m| m.as_ref().to_owned()).collect()
    }

    fn reset(&mut self) -> Location {
        self.location = Self::center(self.size);
        self.rng = StdRng::seed_from_u64(SLIPPERY_SEED);
        self.steps = 0;
        self.location
    }

    /// Unknown labels and moves from a terminal location leave the robot in place
    fn step(&mut self, action: &str) -> StepData<Location> {
        let was_terminal = self.is_terminal();
        match action.parse::<Move>() {
            Ok(mv) if !was_terminal => self.apply(mv),
            _ => debug!("ignoring `{action}` at {:?}", self.location),
        }
        self.steps += 1;

        let reward = if self.goal_achieved() {
            100.0
        } else if self.off_the_grid() {
            debug!("the robot crashes at step {}", self.steps);
            self.location = Location {
                x: self.size,
                y: self.size,
            };
            -100.0
        } else {
            0.0
        };
        if was_terminal {
            return StepData::new(self.location, 0.0, true);
        }
        StepData::new(self.location, reward, self.is_terminal())
    }
}

/// Row index of a location in a table with `(size + 2)^2` states
///
/// Leaves one tile of padding on every side so crashed locations get a row of their own.
pub fn location_index(size: usize, location: &Location) -> usize {
    let width = size as i64 + 2;
    let x = (location.x + 1).clamp(0, width - 1);
    let y = (location.y + 1).clamp(0, width - 1);
    (x * width + y) as usize
}

/// Number of table rows [`location_index`] can produce for a world of `size`
pub fn num_location_states(size: usize) -> usize {
    (size + 2) * (size + 2)
}

/// [`location_index`] over the JSON form of a [`Location`], as seen by remote agents
///
/// Observations that are not locations map to row 0.
pub fn json_location_indexer(size: usize) -> impl Fn(&Value) -> usize + Clone {
    move |observation: &Value| {
        serde_json::from_value::<Location>(observation.clone())
            .map(|location| location_index(size, &location))
            .unwrap_or(0)
    }
}
