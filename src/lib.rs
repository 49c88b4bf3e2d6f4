/// Tabular Q-learning
pub mod algo;

/// Blocking request/response channels over a byte stream
pub mod channel;

/// Newline-delimited JSON framing
pub mod codec;

/// Environments, from the agent's side and from the server's side
pub mod env;

/// Error types
pub mod error;

/// Exploration policies
pub mod exploration;

/// Model management over the command protocol
pub mod model;

/// Command vocabulary and reply shapes
pub mod protocol;

/// Single-connection command server
pub mod server;

/// Testing environments
#[cfg(feature = "gym")]
pub mod gym;

mod util;
