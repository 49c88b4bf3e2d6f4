use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    env::Environment,
    error::{ConfigError, ProtocolError, TrainError, TrainProgress},
    exploration::{Choice, EpsilonGreedy},
    util::check_interval,
};

use super::{
    indexer::{ActionIndexer, Identity, StateIndexer},
    table::{QTable, TableInit},
};

/// Configuration for the [`QLearner`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QLearnerConfig {
    /// Learning rate, in `(0,1]`
    pub alpha: f64,
    /// Discount factor, in `[0,1]`
    pub gamma: f64,
    /// Exploration probability, in `[0,1]`
    pub epsilon: f64,
    /// Seed of the random source used for exploration and table initialization
    pub seed: u64,
    pub init: TableInit,
}

impl Default for QLearnerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            gamma: 0.9,
            epsilon: 0.16,
            seed: 127,
            init: TableInit::default(),
        }
    }
}

impl QLearnerConfig {
    /// Check every hyperparameter against its valid range
    pub fn validate(&self) -> Result<EpsilonGreedy, ConfigError> {
        let Self {
            alpha,
            gamma,
            epsilon,
            ..
        } = *self;
        check_interval!(alpha, > 0.0, 1.0)?;
        check_interval!(gamma, 0.0, 1.0)?;
        if let TableInit::Random { scale } = self.init {
            if !scale.is_finite() {
                return Err(ConfigError::OutOfRange {
                    name: "scale",
                    value: scale,
                    interval: "(-inf, inf)".into(),
                });
            }
        }
        EpsilonGreedy::new(epsilon)
    }
}

/// Summary of a [`QLearner::train`] run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    /// Steps taken across all episodes
    pub total_steps: usize,
    /// Length of every episode that reached a terminal observation
    pub episode_steps: Vec<usize>,
    /// Total reward of every episode that reached a terminal observation
    pub episode_rewards: Vec<f64>,
}

impl TrainReport {
    pub fn episodes(&self) -> usize {
        self.episode_steps.len()
    }
}

/// The actions a greedy policy took in one episode
#[derive(Debug, Clone, PartialEq)]
pub struct GreedyRun {
    /// Labels of the actions taken, in order
    pub actions: Vec<String>,
    /// Reward of the last step
    pub last_reward: f64,
    /// Whether the run stopped on a terminal observation
    pub terminal: bool,
}

/// A tabular Q-learning agent
///
/// Owns its [`QTable`] exclusively. `train` needs `&mut self` and `greedy_run` needs
/// `&self`, so the two can never overlap on one instance.
///
/// ### Generics
/// - `S` - The [`StateIndexer`] mapping observations to table rows
/// - `A` - The [`ActionIndexer`] mapping action indices to table columns, identity by default
pub struct QLearner<S, A = Identity> {
    table: QTable,
    config: QLearnerConfig,
    exploration: EpsilonGreedy,
    rng: StdRng,
    state_indexer: S,
    action_indexer: A,
}

impl<S> QLearner<S> {
    /// Initialize a new `QLearner` with a fresh table
    ///
    /// Fails if a hyperparameter is outside its range or a dimension is zero.
    pub fn new(
        states: usize,
        actions: usize,
        config: QLearnerConfig,
        state_indexer: S,
    ) -> Result<Self, ConfigError> {
        let exploration = config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let table = QTable::new(states, actions, config.init, &mut rng)?;
        Ok(Self {
            table,
            config,
            exploration,
            rng,
            state_indexer,
            action_indexer: Identity,
        })
    }

    /// Initialize a `QLearner` around an existing table, e.g. one loaded from disk
    pub fn from_table(
        table: QTable,
        config: QLearnerConfig,
        state_indexer: S,
    ) -> Result<Self, ConfigError> {
        let exploration = config.validate()?;
        Ok(Self {
            table,
            config,
            exploration,
            rng: StdRng::seed_from_u64(config.seed),
            state_indexer,
            action_indexer: Identity,
        })
    }
}

impl<S, A: ActionIndexer> QLearner<S, A> {
    /// Replace the action indexer
    pub fn with_action_indexer<B: ActionIndexer>(self, action_indexer: B) -> QLearner<S, B> {
        QLearner {
            table: self.table,
            config: self.config,
            exploration: self.exploration,
            rng: self.rng,
            state_indexer: self.state_indexer,
            action_indexer,
        }
    }

    pub fn q_table(&self) -> &QTable {
        &self.table
    }

    pub fn config(&self) -> &QLearnerConfig {
        &self.config
    }

    /// Swap in new hyperparameters and re-seed the random source, keeping the table
    ///
    /// On error the learner is left unchanged.
    pub fn reconfigure(&mut self, config: QLearnerConfig) -> Result<(), ConfigError> {
        self.exploration = config.validate()?;
        self.rng = StdRng::seed_from_u64(config.seed);
        self.config = config;
        Ok(())
    }

    /// Re-seed the random source
    pub fn reseed(&mut self, seed: u64) {
        self.config.seed = seed;
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// The table row of an observation
    pub fn state_index<O: ?Sized>(&self, observation: &O) -> usize
    where
        S: StateIndexer<O>,
    {
        self.state_indexer.index(observation)
    }

    /// The table row of an observation, checked against the size of the table
    pub fn checked_state_index<O: ?Sized>(&self, observation: &O) -> Result<usize, ConfigError>
    where
        S: StateIndexer<O>,
    {
        let state = self.state_index(observation);
        self.table.try_row(state).map(|_| state)
    }

    /// The best action in a state and its value; ties go to the lowest action index
    pub fn best_action_value(&self, state: usize) -> (usize, f64) {
        self.table.best_action_value(state)
    }

    /// The best action for an observation according to the table
    pub fn greedy_action<O: ?Sized>(&self, observation: &O) -> usize
    where
        S: StateIndexer<O>,
    {
        self.best_action_value(self.state_index(observation)).0
    }

    /// Epsilon-greedy action selection
    ///
    /// With probability epsilon a uniformly random action, otherwise the greedy one.
    pub fn choose_action<O: ?Sized>(&mut self, observation: &O) -> usize
    where
        S: StateIndexer<O>,
    {
        match self.exploration.choose(&mut self.rng) {
            Choice::Explore => self.rng.gen_range(0..self.table.num_actions()),
            Choice::Exploit => self.greedy_action(observation),
        }
    }

    /// Epsilon-greedy selection restricted to some actions
    ///
    /// Exploring picks uniformly among `candidates`; exploiting picks the best of them.
    /// **Returns** `None` if `candidates` is empty.
    pub fn choose_action_among<O: ?Sized>(
        &mut self,
        observation: &O,
        candidates: &[usize],
    ) -> Option<usize>
    where
        S: StateIndexer<O>,
    {
        if candidates.is_empty() {
            return None;
        }
        match self.exploration.choose(&mut self.rng) {
            Choice::Explore => Some(candidates[self.rng.gen_range(0..candidates.len())]),
            Choice::Exploit => {
                let state = self.state_index(observation);
                self.table.best_among(state, candidates).map(|(a, _)| a)
            }
        }
    }

    /// Apply the one-step Q-learning update for a transition
    ///
    /// `Q(s,a) <- Q(s,a) + alpha * (reward + gamma * max_b Q(s',b) - Q(s,a))`
    ///
    /// **Panics** if either observation maps outside the table, see
    /// [`checked_state_index`](Self::checked_state_index)
    pub fn apply_reward<O: ?Sized>(
        &mut self,
        state: &O,
        action: usize,
        next_state: &O,
        reward: f64,
    ) where
        S: StateIndexer<O>,
    {
        let s = self.state_index(state);
        let next = self.state_index(next_state);
        let a = self.action_indexer.index(action);

        let q_value = self.table.get(s, a);
        let (_, max_next_q) = self.best_action_value(next);
        let target = reward + self.config.gamma * max_next_q;
        let updated = q_value + self.config.alpha * (target - q_value);
        self.table.set(s, a, updated);
    }

    fn check_action_space<E: Environment>(&self, env: &E) -> Result<(), ConfigError> {
        let actual = env.action_space().len();
        if actual == self.table.num_actions() {
            Ok(())
        } else {
            Err(ConfigError::ActionSpaceMismatch {
                expected: self.table.num_actions(),
                actual,
            })
        }
    }

    /// Run episodic Q-learning until `max_steps` steps have been taken in total
    ///
    /// Whenever a step is terminal the environment is reset and a new episode starts.
    /// A session failure aborts training; the error carries the counters reached. An
    /// observation the state indexer maps outside the table fails with
    /// [`ConfigError::StateOutOfRange`].
    pub fn train<E>(&mut self, env: &mut E, max_steps: usize) -> Result<TrainReport, TrainError>
    where
        E: Environment,
        S: StateIndexer<E::Observation>,
    {
        self.check_action_space(env)?;
        info!("training for {max_steps} steps");

        let mut progress = TrainProgress::default();
        let mut report = TrainReport::default();
        let mut observation = env.reset().map_err(|e| session_failed(e, progress))?;

        while progress.total_steps < max_steps {
            self.checked_state_index(&observation)?;
            let action = self.choose_action(&observation);
            let step = env.step(action).map_err(|e| session_failed(e, progress))?;
            progress.total_steps += 1;
            progress.episode_steps += 1;
            progress.episode_reward += step.rw;

            self.checked_state_index(&step.obs)?;
            self.apply_reward(&observation, action, &step.obs, step.rw);

            if step.end {
                debug!(
                    "episode {}: {} steps, last reward {}, total reward {}",
                    progress.episodes, progress.episode_steps, step.rw, progress.episode_reward
                );
                report.episode_steps.push(progress.episode_steps);
                report.episode_rewards.push(progress.episode_reward);
                progress.episodes += 1;
                progress.episode_steps = 0;
                progress.episode_reward = 0.0;
                if progress.total_steps < max_steps {
                    observation = env.reset().map_err(|e| session_failed(e, progress))?;
                }
            } else {
                observation = step.obs;
            }
        }

        report.total_steps = progress.total_steps;
        info!(
            "training finished: {} steps, {} episodes",
            report.total_steps,
            report.episodes()
        );
        Ok(report)
    }

    /// Play one episode always taking the greedy action, without learning
    ///
    /// Stops at the first terminal observation or after `max_steps` steps. Never
    /// touches the random source or the table.
    pub fn greedy_run<E>(&self, env: &mut E, max_steps: usize) -> Result<GreedyRun, TrainError>
    where
        E: Environment,
        S: StateIndexer<E::Observation>,
    {
        self.check_action_space(env)?;

        let mut progress = TrainProgress::default();
        let mut run = GreedyRun {
            actions: Vec::new(),
            last_reward: 0.0,
            terminal: false,
        };
        let mut observation = env.reset().map_err(|e| session_failed(e, progress))?;

        while !run.terminal && progress.total_steps < max_steps {
            self.checked_state_index(&observation)?;
            let action = self.greedy_action(&observation);
            let step = env.step(action).map_err(|e| session_failed(e, progress))?;
            progress.total_steps += 1;
            progress.episode_steps += 1;
            progress.episode_reward += step.rw;

            let label = env.action_space()[action].clone();
            info!(
                "action {label}, terminal={}, last reward={}, total reward={}",
                step.end, step.rw, progress.episode_reward
            );
            run.actions.push(label);
            run.last_reward = step.rw;
            run.terminal = step.end;
            observation = step.obs;
        }

        Ok(run)
    }
}

fn session_failed(source: ProtocolError, progress: TrainProgress) -> TrainError {
    TrainError::Protocol { source, progress }
}
