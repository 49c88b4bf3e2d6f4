use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    algo::{QLearner, QLearnerConfig, QTable, StateIndexer},
    error::{ConfigError, ProtocolError},
    protocol::{Command, ACK},
    server::Interpreter,
};

/// Argument of GET_NEXTACTION
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionQuery {
    /// Current observation
    pub st: Value,
    /// Action that led to `st`, `None` at the start of an episode
    #[serde(default)]
    pub prev: Option<String>,
    /// Reward received for `prev`
    #[serde(default)]
    pub rew: f64,
    /// Actions possible in `st`, every known action if absent
    #[serde(default)]
    pub opts: Option<Vec<String>>,
}

/// A trainable model managed over the command protocol
///
/// Configuration arguments are passed through as JSON since their shape belongs to
/// the model.
pub trait ModelStore {
    /// Replace the current model with an untrained one
    fn make_fresh(&mut self, config: Value) -> Result<(), ProtocolError>;

    /// Reconfigure the training algorithm of the current model
    fn set_training_config(&mut self, config: Value) -> Result<(), ProtocolError>;

    fn save(&self, path: &Path) -> Result<(), ProtocolError>;

    fn load(&mut self, path: &Path) -> Result<(), ProtocolError>;

    /// Learn from the outcome of the previous action and pick the next one to try
    fn next_action(&mut self, query: ActionQuery) -> Result<String, ProtocolError>;

    /// The best action for an observation, without learning
    fn next_trained_action(&self, observation: &Value) -> Result<String, ProtocolError>;
}

/// Serves the model-management commands for a [`ModelStore`]
pub struct ModelInterpreter<M> {
    model: M,
}

impl<M: ModelStore> ModelInterpreter<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PathArg {
    Plain(PathBuf),
    Named { filename: PathBuf },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ObservationArg {
    Wrapped { obs: Value },
    Bare(Value),
}

fn parse<T: DeserializeOwned>(command: Command, argument: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(argument)
        .map_err(|e| ProtocolError::invalid_argument(command, e.to_string()))
}

fn parse_path(command: Command, argument: Value) -> Result<PathBuf, ProtocolError> {
    Ok(match parse(command, argument)? {
        PathArg::Plain(path) | PathArg::Named { filename: path } => path,
    })
}

impl<M: ModelStore> Interpreter for ModelInterpreter<M> {
    fn handle(&mut self, command: Command, argument: Value) -> Result<Value, ProtocolError> {
        let ack = Value::from(ACK);
        match command {
            Command::MkFreshModel => self.model.make_fresh(argument).map(|_| ack),
            Command::SetTrainingConfig => self.model.set_training_config(argument).map(|_| ack),
            Command::Save => {
                let path = parse_path(command, argument)?;
                self.model.save(&path).map(|_| ack)
            }
            Command::Load => {
                let path = parse_path(command, argument)?;
                self.model.load(&path).map(|_| ack)
            }
            Command::GetNextAction => {
                let query = parse(command, argument)?;
                self.model.next_action(query).map(Value::from)
            }
            Command::GetNextTrainedAction => {
                let observation = match parse(command, argument)? {
                    ObservationArg::Wrapped { obs } | ObservationArg::Bare(obs) => obs,
                };
                self.model.next_trained_action(&observation).map(Value::from)
            }
            Command::GetActionSpace
            | Command::Reset
            | Command::Step
            | Command::Close
            | Command::Kill => Err(ProtocolError::Unsupported(command)),
        }
    }
}

/// Argument of MK_FRESH_MODEL for a [`QTableModel`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshModelConfig {
    /// Number of table rows
    pub states: usize,
    /// Ordered action labels
    pub actions: Vec<String>,
    #[serde(flatten)]
    pub training: TrainingConfig,
}

/// Hyperparameter overrides; absent fields keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub alpha: Option<f64>,
    pub gamma: Option<f64>,
    pub epsilon: Option<f64>,
    pub seed: Option<u64>,
}

impl TrainingConfig {
    fn apply(self, base: QLearnerConfig) -> QLearnerConfig {
        QLearnerConfig {
            alpha: self.alpha.unwrap_or(base.alpha),
            gamma: self.gamma.unwrap_or(base.gamma),
            epsilon: self.epsilon.unwrap_or(base.epsilon),
            seed: self.seed.unwrap_or(base.seed),
            init: base.init,
        }
    }
}

/// On-disk form of a [`QTableModel`]
#[derive(Serialize, Deserialize)]
struct SavedModel {
    actions: Vec<String>,
    config: QLearnerConfig,
    table: QTable,
}

struct Trained<S> {
    learner: QLearner<S>,
    actions: Vec<String>,
    /// Observation the last chosen action was taken in
    last_state: Option<Value>,
}

/// A [`ModelStore`] backed by a [`QLearner`], persisted as JSON
///
/// Starts without a model; every command other than MK_FRESH_MODEL and LOAD is
/// rejected until one exists.
pub struct QTableModel<S> {
    indexer: S,
    model: Option<Trained<S>>,
}

impl<S> QTableModel<S>
where
    S: StateIndexer<Value> + Clone,
{
    pub fn new(indexer: S) -> Self {
        Self {
            indexer,
            model: None,
        }
    }

    pub fn learner(&self) -> Option<&QLearner<S>> {
        self.model.as_ref().map(|m| &m.learner)
    }

    fn trained(&self, command: Command) -> Result<&Trained<S>, ProtocolError> {
        self.model.as_ref().ok_or_else(|| no_model(command))
    }

    fn trained_mut(&mut self, command: Command) -> Result<&mut Trained<S>, ProtocolError> {
        self.model.as_mut().ok_or_else(|| no_model(command))
    }
}

fn no_model(command: Command) -> ProtocolError {
    ProtocolError::rejected(command, "no model, send MK_FRESH_MODEL or LOAD first")
}

impl<S: StateIndexer<Value>> Trained<S> {
    fn action_index(&self, command: Command, label: &str) -> Result<usize, ProtocolError> {
        self.actions.iter().position(|a| a == label).ok_or_else(|| {
            ProtocolError::invalid_argument(command, format!("unknown action `{label}`"))
        })
    }

    /// Fails if the observation maps outside the table
    fn check_observation(
        &self,
        command: Command,
        observation: &Value,
    ) -> Result<(), ProtocolError> {
        self.learner
            .checked_state_index(observation)
            .map(drop)
            .map_err(|e| config_error(command, e))
    }
}

fn config_error(command: Command, err: ConfigError) -> ProtocolError {
    ProtocolError::invalid_argument(command, err.to_string())
}

impl<S> ModelStore for QTableModel<S>
where
    S: StateIndexer<Value> + Clone,
{
    fn make_fresh(&mut self, config: Value) -> Result<(), ProtocolError> {
        let command = Command::MkFreshModel;
        let FreshModelConfig {
            states,
            actions,
            training,
        } = parse(command, config)?;
        let config = training.apply(QLearnerConfig::default());
        let learner = QLearner::new(states, actions.len(), config, self.indexer.clone())
            .map_err(|e| config_error(command, e))?;
        info!("fresh model: {states} states, actions {actions:?}");
        self.model = Some(Trained {
            learner,
            actions,
            last_state: None,
        });
        Ok(())
    }

    fn set_training_config(&mut self, config: Value) -> Result<(), ProtocolError> {
        let command = Command::SetTrainingConfig;
        let overrides: TrainingConfig = parse(command, config)?;
        let model = self.trained_mut(command)?;
        let config = overrides.apply(*model.learner.config());
        model
            .learner
            .reconfigure(config)
            .map_err(|e| config_error(command, e))?;
        debug!("training config: {config:?}");
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), ProtocolError> {
        let command = Command::Save;
        let model = self.trained(command)?;
        let saved = SavedModel {
            actions: model.actions.clone(),
            config: *model.learner.config(),
            table: model.learner.q_table().clone(),
        };
        let json = serde_json::to_vec(&saved)?;
        fs::write(path, json)
            .map_err(|e| ProtocolError::rejected(command, format!("{}: {e}", path.display())))?;
        info!("saved model to {}", path.display());
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<(), ProtocolError> {
        let command = Command::Load;
        let reject = |reason: String| {
            ProtocolError::rejected(command, format!("{}: {reason}", path.display()))
        };
        let bytes = fs::read(path).map_err(|e| reject(e.to_string()))?;
        let saved: SavedModel =
            serde_json::from_slice(&bytes).map_err(|e| reject(e.to_string()))?;
        if saved.actions.len() != saved.table.num_actions() {
            return Err(reject(
                ConfigError::ActionSpaceMismatch {
                    expected: saved.table.num_actions(),
                    actual: saved.actions.len(),
                }
                .to_string(),
            ));
        }
        let learner = QLearner::from_table(saved.table, saved.config, self.indexer.clone())
            .map_err(|e| reject(e.to_string()))?;
        info!("loaded model from {}", path.display());
        self.model = Some(Trained {
            learner,
            actions: saved.actions,
            last_state: None,
        });
        Ok(())
    }

    fn next_action(&mut self, query: ActionQuery) -> Result<String, ProtocolError> {
        let command = Command::GetNextAction;
        let model = self.trained_mut(command)?;

        let candidates = match &query.opts {
            Some(opts) => opts
                .iter()
                .map(|label| model.action_index(command, label))
                .collect::<Result<Vec<_>, _>>()?,
            None => (0..model.actions.len()).collect(),
        };
        if candidates.is_empty() {
            return Err(ProtocolError::invalid_argument(command, "no possible actions"));
        }
        model.check_observation(command, &query.st)?;

        if let Some(prev) = &query.prev {
            let action = model.action_index(command, prev)?;
            match model.last_state.take() {
                Some(old) => model.learner.apply_reward(&old, action, &query.st, query.rew),
                None => debug!("no previous observation for `{prev}`, reward ignored"),
            }
        }

        let action = model
            .learner
            .choose_action_among(&query.st, &candidates)
            .ok_or_else(|| ProtocolError::invalid_argument(command, "no possible actions"))?;
        model.last_state = Some(query.st);
        Ok(model.actions[action].clone())
    }

    fn next_trained_action(&self, observation: &Value) -> Result<String, ProtocolError> {
        let command = Command::GetNextTrainedAction;
        let model = self.trained(command)?;
        model.check_observation(command, observation)?;
        Ok(model.actions[model.learner.greedy_action(observation)].clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Observations are `{"s": <row>}`
    fn row_of(observation: &Value) -> usize {
        observation["s"].as_u64().unwrap_or(0) as usize
    }

    type Model = QTableModel<fn(&Value) -> usize>;

    fn interpreter() -> ModelInterpreter<Model> {
        ModelInterpreter::new(QTableModel::new(row_of as fn(&Value) -> usize))
    }

    fn fresh(interp: &mut ModelInterpreter<Model>, epsilon: f64) {
        let config = json!({
            "states": 2,
            "actions": ["left", "right"],
            "epsilon": epsilon,
            "alpha": 1.0
        });
        let reply = interp.handle(Command::MkFreshModel, config).unwrap();
        assert_eq!(reply, json!(ACK));
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gym_bridge-{}-{name}", std::process::id()))
    }

    #[test]
    fn commands_need_a_model() {
        let mut interp = interpreter();
        for (command, argument) in [
            (Command::GetNextAction, json!({"st": {"s": 0}, "prev": null, "rew": 0})),
            (Command::GetNextTrainedAction, json!({"s": 0})),
            (Command::SetTrainingConfig, json!({"epsilon": 0.5})),
            (Command::Save, json!("unused.json")),
        ] {
            assert!(
                matches!(interp.handle(command, argument), Err(ProtocolError::Rejected { .. })),
                "{command} without a model"
            );
        }
    }

    #[test]
    fn fresh_model_validates_config() {
        let mut interp = interpreter();
        let bad_gamma = json!({"states": 2, "actions": ["a"], "gamma": 4.0});
        assert!(matches!(
            interp.handle(Command::MkFreshModel, bad_gamma),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        let huge = json!({"states": u64::MAX, "actions": ["a", "b"]});
        assert!(matches!(
            interp.handle(Command::MkFreshModel, huge),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        assert!(interp.model().learner().is_none());
        assert!(matches!(
            interp.handle(Command::MkFreshModel, json!({"actions": ["a"]})),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        fresh(&mut interp, 0.0);
        let config = interp.model().learner().unwrap().config();
        assert_eq!((config.alpha, config.gamma, config.epsilon), (1.0, 0.9, 0.0));
    }

    #[test]
    fn next_action_learns_from_previous_reward() {
        let mut interp = interpreter();
        fresh(&mut interp, 0.0);

        let first = interp
            .handle(Command::GetNextAction, json!({"st": {"s": 0}, "prev": null, "rew": 0}))
            .unwrap();
        let first = first.as_str().unwrap().to_owned();

        interp
            .handle(
                Command::GetNextAction,
                json!({"st": {"s": 1}, "prev": first, "rew": 10.0}),
            )
            .unwrap();

        let learner = interp.model().learner().unwrap();
        let column = if first == "left" { 0 } else { 1 };
        assert!(learner.q_table().get(0, column) > 9.0, "Reward was applied to state 0");
        assert_eq!(
            interp.handle(Command::GetNextTrainedAction, json!({"obs": {"s": 0}})).unwrap(),
            json!(first)
        );
    }

    #[test]
    fn next_action_respects_opts() {
        let mut interp = interpreter();
        fresh(&mut interp, 1.0);
        for _ in 0..20 {
            let reply = interp
                .handle(
                    Command::GetNextAction,
                    json!({"st": {"s": 0}, "prev": null, "rew": 0, "opts": ["right"]}),
                )
                .unwrap();
            assert_eq!(reply, json!("right"));
        }
        assert!(matches!(
            interp.handle(Command::GetNextAction, json!({"st": {"s": 0}, "opts": ["jump"]})),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        assert!(matches!(
            interp.handle(Command::GetNextAction, json!({"st": {"s": 0}, "opts": []})),
            Err(ProtocolError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn observations_outside_the_table_are_refused() {
        let mut interp = interpreter();
        fresh(&mut interp, 0.0);
        let table = interp.model().learner().unwrap().q_table().clone();

        assert!(matches!(
            interp.handle(Command::GetNextTrainedAction, json!({"obs": {"s": 5}})),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        interp
            .handle(Command::GetNextAction, json!({"st": {"s": 0}, "prev": null}))
            .unwrap();
        let outside = json!({"st": {"s": 9}, "prev": "left", "rew": 1});
        assert!(matches!(
            interp.handle(Command::GetNextAction, outside),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        assert_eq!(
            interp.model().learner().unwrap().q_table(),
            &table,
            "A refused query teaches nothing"
        );
    }

    #[test]
    fn refused_query_keeps_previous_observation() {
        let mut interp = interpreter();
        fresh(&mut interp, 0.0);
        interp
            .handle(Command::GetNextAction, json!({"st": {"s": 0}, "prev": null}))
            .unwrap();
        let table = interp.model().learner().unwrap().q_table().clone();

        let empty = json!({"st": {"s": 1}, "prev": "left", "rew": 10.0, "opts": []});
        assert!(interp.handle(Command::GetNextAction, empty).is_err());
        assert_eq!(interp.model().learner().unwrap().q_table(), &table);

        let retry = json!({"st": {"s": 1}, "prev": "left", "rew": 10.0});
        interp.handle(Command::GetNextAction, retry).unwrap();
        assert!(
            interp.model().learner().unwrap().q_table().get(0, 0) > 9.0,
            "The retried reward still reaches state 0"
        );
    }

    #[test]
    fn save_and_load() {
        let path = temp_path("save_and_load.json");
        let mut interp = interpreter();
        fresh(&mut interp, 0.0);
        interp
            .handle(Command::Save, json!({ "filename": path.to_str().unwrap() }))
            .unwrap();
        let saved = interp.model().learner().unwrap().q_table().clone();

        let mut other = interpreter();
        other.handle(Command::Load, json!(path.to_str().unwrap())).unwrap();
        assert_eq!(other.model().learner().unwrap().q_table(), &saved);

        fs::remove_file(&path).unwrap();
        assert!(matches!(
            other.handle(Command::Load, json!(path.to_str().unwrap())),
            Err(ProtocolError::Rejected { .. })
        ));
    }

    #[test]
    fn environment_commands_are_unsupported() {
        let mut interp = interpreter();
        assert!(matches!(
            interp.handle(Command::Reset, Value::Null),
            Err(ProtocolError::Unsupported(Command::Reset))
        ));
    }
}
