use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, info};
use serde::Serialize;
use serde_json::Value;

use crate::{
    channel::{ChannelConfig, CommandChannel},
    error::ProtocolError,
    protocol::{check_reply, Command, StepData, ACK},
    server::Interpreter,
};

/// An episodic environment with a finite, discrete action space, as seen by an agent
///
/// Actions are addressed by their 0-based index into [`action_space`](Environment::action_space).
pub trait Environment {
    /// A representation of the state of the environment to be passed to an agent
    type Observation;

    /// The ordered labels of the available actions
    fn action_space(&self) -> &[String];

    /// Reset the environment to an initial state, starting a new episode
    fn reset(&mut self) -> Result<Self::Observation, ProtocolError>;

    /// Apply the action with the given index
    fn step(&mut self, action: usize) -> Result<StepData<Self::Observation>, ProtocolError>;
}

/// Agent-side handle to an environment hosted by a remote command server
///
/// The action space is queried once, right after connecting, and cached.
pub struct EnvClient<R = TcpStream, W = TcpStream> {
    channel: CommandChannel<R, W>,
    action_space: Vec<String>,
}

impl EnvClient {
    pub fn connect(
        addr: impl ToSocketAddrs,
        config: &ChannelConfig,
    ) -> Result<Self, ProtocolError> {
        Self::from_channel(CommandChannel::connect(addr, config)?)
    }

    pub fn connect_with_retry(
        addr: impl ToSocketAddrs,
        config: &ChannelConfig,
        max_wait: Duration,
    ) -> Result<Self, ProtocolError> {
        Self::from_channel(CommandChannel::connect_with_retry(addr, config, max_wait)?)
    }
}

impl<R: Read, W: Write> EnvClient<R, W> {
    /// Take over an open channel and fetch the action space
    pub fn from_channel(mut channel: CommandChannel<R, W>) -> Result<Self, ProtocolError> {
        let reply = check_reply(channel.send(Command::GetActionSpace.as_ref(), Value::Null)?)?;
        let action_space: Vec<String> = serde_json::from_value(reply)?;
        info!("action space: {action_space:?}");
        Ok(Self {
            channel,
            action_space,
        })
    }

    fn request(&mut self, command: Command, argument: Value) -> Result<Value, ProtocolError> {
        check_reply(self.channel.send(command.as_ref(), argument)?)
    }

    /// Apply an action by its label
    pub fn step_label(&mut self, label: &str) -> Result<StepData<Value>, ProtocolError> {
        let reply = self.request(Command::Step, Value::String(label.to_owned()))?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Release the remote environment; the server keeps running
    pub fn soft_close(&mut self) -> Result<(), ProtocolError> {
        self.request(Command::Close, Value::Null).map(drop)
    }

    /// Release the remote environment and terminate the server
    pub fn close(mut self) -> Result<(), ProtocolError> {
        self.soft_close()?;
        self.channel.send_final(Command::Kill.as_ref(), Value::Null)
    }
}

impl<R: Read, W: Write> Environment for EnvClient<R, W> {
    type Observation = Value;

    fn action_space(&self) -> &[String] {
        &self.action_space
    }

    fn reset(&mut self) -> Result<Value, ProtocolError> {
        self.request(Command::Reset, Value::Null)
    }

    fn step(&mut self, action: usize) -> Result<StepData<Value>, ProtocolError> {
        let label = self.action_space.get(action).cloned().ok_or_else(|| {
            ProtocolError::invalid_argument(
                Command::Step,
                format!("action index {action} outside 0..{}", self.action_space.len()),
            )
        })?;
        self.step_label(&label)
    }
}

/// An environment implementation hosted behind a command server
pub trait GymEnv {
    type Observation: Serialize;

    /// The labels of the actions this environment understands
    fn action_space(&self) -> Vec<String>;

    /// Reset the environment back to its initial state
    fn reset(&mut self) -> Self::Observation;

    /// Perform the action with the given label
    fn step(&mut self, action: &str) -> StepData<Self::Observation>;

    /// Clean up, if needed
    fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Episode {
    NotStarted,
    Running,
    Terminated,
}

/// Serves the environment commands for a [`GymEnv`]
///
/// STEP is only accepted inside an episode: before the first RESET, after CLOSE,
/// or after a terminal step it is rejected and the environment is left untouched.
pub struct GymEnvInterpreter<E> {
    env: E,
    episode: Episode,
}

impl<E: GymEnv> GymEnvInterpreter<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            episode: Episode::NotStarted,
        }
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn into_inner(self) -> E {
        self.env
    }

    fn step(&mut self, argument: Value) -> Result<Value, ProtocolError> {
        let action = match argument {
            Value::String(action) => action,
            other => {
                return Err(ProtocolError::invalid_argument(
                    Command::Step,
                    format!("expected an action label, got {other}"),
                ))
            }
        };
        let reason = match self.episode {
            Episode::Running => None,
            Episode::NotStarted => Some("no episode started, send RESET first"),
            Episode::Terminated => Some("episode has terminated, send RESET first"),
        };
        if let Some(reason) = reason {
            return Err(ProtocolError::rejected(Command::Step, reason));
        }
        if !self.env.action_space().contains(&action) {
            return Err(ProtocolError::invalid_argument(
                Command::Step,
                format!("unknown action `{action}`"),
            ));
        }

        let step = self.env.step(&action);
        if step.end {
            debug!("episode terminated by `{action}`");
            self.episode = Episode::Terminated;
        }
        Ok(serde_json::to_value(step)?)
    }
}

impl<E: GymEnv> Interpreter for GymEnvInterpreter<E> {
    fn handle(&mut self, command: Command, argument: Value) -> Result<Value, ProtocolError> {
        match command {
            Command::GetActionSpace => Ok(serde_json::to_value(self.env.action_space())?),
            Command::Reset => {
                let observation = self.env.reset();
                self.episode = Episode::Running;
                Ok(serde_json::to_value(observation)?)
            }
            Command::Step => self.step(argument),
            Command::Close => {
                self.env.close();
                self.episode = Episode::NotStarted;
                Ok(Value::from(ACK))
            }
            Command::Kill
            | Command::Load
            | Command::Save
            | Command::MkFreshModel
            | Command::SetTrainingConfig
            | Command::GetNextAction
            | Command::GetNextTrainedAction => Err(ProtocolError::Unsupported(command)),
        }
    }

    fn on_kill(&mut self) {
        self.env.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;
    use crate::{codec::encode, protocol::error_reply};

    /// One state, two actions: "up" pays 1, "down" pays 0, both end the episode
    pub(crate) struct Coin {
        pub(crate) closed: bool,
    }

    impl GymEnv for Coin {
        type Observation = u8;

        fn action_space(&self) -> Vec<String> {
            vec!["up".into(), "down".into()]
        }

        fn reset(&mut self) -> u8 {
            7
        }

        fn step(&mut self, action: &str) -> StepData<u8> {
            StepData::new(7, if action == "up" { 1.0 } else { 0.0 }, true)
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn interpreter() -> GymEnvInterpreter<Coin> {
        GymEnvInterpreter::new(Coin { closed: false })
    }

    #[test]
    fn serves_environment_commands() {
        let mut interp = interpreter();
        assert_eq!(
            interp.handle(Command::GetActionSpace, Value::Null).unwrap(),
            json!(["up", "down"])
        );
        assert_eq!(interp.handle(Command::Reset, Value::Null).unwrap(), json!(7));
        assert_eq!(
            interp.handle(Command::Step, json!("up")).unwrap(),
            json!({"obs": 7, "rw": 1.0, "end": true})
        );
        assert_eq!(interp.handle(Command::Close, Value::Null).unwrap(), json!(ACK));
        assert!(interp.env().closed, "CLOSE reaches the environment");
    }

    #[test]
    fn step_outside_episode_is_rejected() {
        let mut interp = interpreter();
        assert!(
            matches!(
                interp.handle(Command::Step, json!("up")),
                Err(ProtocolError::Rejected { .. })
            ),
            "STEP before RESET"
        );

        interp.handle(Command::Reset, Value::Null).unwrap();
        interp.handle(Command::Step, json!("down")).unwrap();
        assert!(
            matches!(
                interp.handle(Command::Step, json!("down")),
                Err(ProtocolError::Rejected { .. })
            ),
            "STEP after a terminal step"
        );

        interp.handle(Command::Reset, Value::Null).unwrap();
        assert!(interp.handle(Command::Step, json!("down")).is_ok(), "RESET reopens the episode");
    }

    #[test]
    fn bad_step_arguments() {
        let mut interp = interpreter();
        interp.handle(Command::Reset, Value::Null).unwrap();
        assert!(matches!(
            interp.handle(Command::Step, json!("sideways")),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        assert!(matches!(
            interp.handle(Command::Step, json!(0)),
            Err(ProtocolError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn model_commands_are_unsupported() {
        let mut interp = interpreter();
        assert!(matches!(
            interp.handle(Command::Save, json!("model.json")),
            Err(ProtocolError::Unsupported(Command::Save))
        ));
    }

    fn client_over(replies: &[Value]) -> EnvClient<Cursor<Vec<u8>>, Vec<u8>> {
        let bytes: Vec<u8> = replies.iter().flat_map(|r| encode(r).unwrap()).collect();
        let config = ChannelConfig::default();
        let channel = CommandChannel::new(Cursor::new(bytes), Vec::new(), &config);
        EnvClient::from_channel(channel).unwrap()
    }

    #[test]
    fn client_maps_indices_to_labels() {
        let mut client = client_over(&[
            json!(["up", "down"]),
            json!({"x": 0}),
            json!({"obs": {"x": 1}, "rw": 1, "end": true}),
        ]);
        assert_eq!(client.action_space(), &["up", "down"]);
        assert_eq!(client.reset().unwrap(), json!({"x": 0}));
        let step = client.step(0).unwrap();
        assert_eq!(step, StepData::new(json!({"x": 1}), 1.0, true));
        assert!(matches!(
            client.step(2),
            Err(ProtocolError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn client_surfaces_error_replies() {
        let rejection = error_reply(&ProtocolError::rejected(Command::Step, "no episode"));
        let mut client = client_over(&[json!(["up"]), rejection]);
        assert!(matches!(
            client.step_label("up"),
            Err(ProtocolError::Remote { kind, .. }) if kind == "Rejected"
        ));
    }
}
