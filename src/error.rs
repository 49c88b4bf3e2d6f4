use std::io;

use thiserror::Error;

use crate::protocol::Command;

/// Errors raised while exchanging commands over a session
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The bytes of one frame could not be parsed as the expected message shape
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The peer closed the stream before the exchange completed
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A command name outside the protocol vocabulary
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    /// A known command that the attached interpreter does not serve
    #[error("command `{0}` is not supported by this server")]
    Unsupported(Command),

    /// A well-formed command the interpreter refused in its current state
    #[error("`{command}` rejected: {reason}")]
    Rejected { command: Command, reason: String },

    /// The command argument does not have the shape the interpreter expects
    #[error("invalid argument for `{command}`: {reason}")]
    InvalidArgument { command: Command, reason: String },

    /// A blocking receive exceeded its deadline
    #[error("timed out waiting for the peer")]
    Timeout,

    /// The peer answered with an error reply
    #[error("peer replied with {kind}: {message}")]
    Remote { kind: String, message: String },

    #[error(transparent)]
    Io(io::Error),
}

impl ProtocolError {
    /// Short machine-readable name, used as the `error` field of error replies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "MalformedMessage",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::UnknownCommand(_) => "UnknownCommand",
            Self::Unsupported(_) => "Unsupported",
            Self::Rejected { .. } => "Rejected",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::Timeout => "Timeout",
            Self::Remote { .. } => "Remote",
            Self::Io(_) => "Io",
        }
    }

    pub(crate) fn invalid_argument(command: Command, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            command,
            reason: reason.into(),
        }
    }

    pub(crate) fn rejected(command: Command, reason: impl Into<String>) -> Self {
        Self::Rejected {
            command,
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}

/// Invalid hyperparameters or table dimensions, raised at construction
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for `{name}`: {value}. Must be in the interval {interval}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        interval: String,
    },

    #[error("`{0}` must be greater than zero")]
    EmptyDimension(&'static str),

    #[error("environment offers {actual} actions but the table was built for {expected}")]
    ActionSpaceMismatch { expected: usize, actual: usize },

    #[error("a {states}x{actions} table exceeds the limit of {max} entries")]
    TableTooLarge {
        states: usize,
        actions: usize,
        max: usize,
    },

    #[error("state index {index} is outside the table (0..{states})")]
    StateOutOfRange { index: usize, states: usize },
}

/// Counters of a training loop, as they stood when it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainProgress {
    /// Steps taken across all episodes
    pub total_steps: usize,
    /// Episodes that reached a terminal observation
    pub episodes: usize,
    /// Steps taken in the episode in progress
    pub episode_steps: usize,
    /// Reward accumulated in the episode in progress
    pub episode_reward: f64,
}

/// Failure of [`QLearner::train`](crate::algo::QLearner::train) or
/// [`QLearner::greedy_run`](crate::algo::QLearner::greedy_run)
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("environment session failed after {} steps: {source}", .progress.total_steps)]
    Protocol {
        #[source]
        source: ProtocolError,
        progress: TrainProgress,
    },
}
