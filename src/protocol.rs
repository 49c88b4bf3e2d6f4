use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::ProtocolError;

/// Reply used to acknowledge commands that have no other result
pub const ACK: &str = "OK__";

/// The closed command vocabulary
///
/// Names are case-sensitive on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, IntoStaticStr, EnumIter,
)]
pub enum Command {
    /// Ask for the ordered list of action labels
    #[strum(to_string = "GET_ACTIONSPACE")]
    GetActionSpace,
    /// Start a new episode; replies with the initial observation
    #[strum(to_string = "RESET")]
    Reset,
    /// Apply an action label; replies with [`StepData`]
    #[strum(to_string = "STEP")]
    Step,
    /// Release environment resources; the session stays open
    #[strum(to_string = "CLOSE")]
    Close,
    /// Terminate the server; never answered
    #[strum(to_string = "KILL")]
    Kill,

    #[strum(to_string = "LOAD")]
    Load,
    #[strum(to_string = "SAVE")]
    Save,
    #[strum(to_string = "MK_FRESH_MODEL")]
    MkFreshModel,
    #[strum(to_string = "SET_TRAINING_CONFIG")]
    SetTrainingConfig,
    #[strum(to_string = "GET_NEXTACTION")]
    GetNextAction,
    #[strum(to_string = "GET_NEXT_TRAINEDACTION")]
    GetNextTrainedAction,
}

impl Command {
    /// Commands that drive a simulated environment
    pub fn is_environment(self) -> bool {
        matches!(
            self,
            Self::GetActionSpace | Self::Reset | Self::Step | Self::Close | Self::Kill
        )
    }

    /// Commands routed to a model store
    pub fn is_model_management(self) -> bool {
        !self.is_environment()
    }

    /// Whether the initiator waits for a reply after sending this command
    pub fn expects_reply(self) -> bool {
        self != Self::Kill
    }
}

/// Result of one environment step, encoded as `{"obs": .., "rw": .., "end": ..}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData<O> {
    /// Observation after the action was applied
    pub obs: O,
    /// Scalar reward for the action
    pub rw: f64,
    /// True if the new observation is terminal
    pub end: bool,
}

impl<O> StepData<O> {
    pub fn new(obs: O, reward: f64, end: bool) -> Self {
        Self {
            obs,
            rw: reward,
            end,
        }
    }
}

/// Encode an interpreter failure as a reply value
///
/// The shape is `{"error": <kind>, "message": <text>}`.
pub fn error_reply(err: &ProtocolError) -> Value {
    json!({ "error": err.kind(), "message": err.to_string() })
}

/// Turn an error reply back into a [`ProtocolError::Remote`], pass other values through
pub fn check_reply(reply: Value) -> Result<Value, ProtocolError> {
    if let Value::Object(map) = &reply {
        if map.len() == 2 {
            if let (Some(Value::String(kind)), Some(Value::String(message))) =
                (map.get("error"), map.get("message"))
            {
                return Err(ProtocolError::Remote {
                    kind: kind.clone(),
                    message: message.clone(),
                });
            }
        }
    }
    Ok(reply)
}
