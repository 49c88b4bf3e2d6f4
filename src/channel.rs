use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use serde_json::Value;

use crate::{
    codec::{Frame, FrameReader, FrameWriter, Message, DEFAULT_MAX_FRAME_LEN},
    error::ProtocolError,
};

/// Configuration shared by both ends of a session
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Deadline for a single blocking receive; `None` blocks indefinitely
    pub read_timeout: Option<Duration>,
    /// Frames larger than this are rejected as malformed
    pub max_frame_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Lifecycle of a session
///
/// A session is connecting while [`CommandChannel::connect`] or
/// [`CommandChannel::connect_with_retry`] runs, so every channel value starts out open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

/// What the responding side received
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Command(Message),
    /// The peer closed the stream without sending another command
    SessionEnded,
}

/// Initiating end of a session: sends a command and blocks until its reply arrives
///
/// Strictly one exchange in flight. `send` takes `&mut self`, so a second command
/// cannot be issued before the reply to the first has been decoded.
pub struct CommandChannel<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    state: SessionState,
}

impl CommandChannel<TcpStream, TcpStream> {
    /// Connect to a command server
    pub fn connect(
        addr: impl ToSocketAddrs,
        config: &ChannelConfig,
    ) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr)?;
        Self::from_tcp(stream, config)
    }

    /// Keep trying to connect until `max_wait` has elapsed
    ///
    /// Useful when the peer process is launched at the same time and may not be
    /// listening yet.
    pub fn connect_with_retry(
        addr: impl ToSocketAddrs,
        config: &ChannelConfig,
        max_wait: Duration,
    ) -> Result<Self, ProtocolError> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        info!(
            "connecting to {:?} (giving up after {}s)",
            addrs,
            max_wait.as_secs_f32()
        );
        let start = Instant::now();
        loop {
            match TcpStream::connect(&addrs[..]) {
                Ok(stream) => return Self::from_tcp(stream, config),
                Err(e) if start.elapsed() < max_wait => {
                    trace!("connect attempt failed: {e}");
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!("could not establish a connection with {:?}", addrs);
                    return Err(e.into());
                }
            }
        }
    }

    /// Wrap an already connected stream
    pub fn from_tcp(stream: TcpStream, config: &ChannelConfig) -> Result<Self, ProtocolError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(config.read_timeout)?;
        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        info!("connected with {peer}");
        Ok(Self::new(reader, stream, config))
    }
}

impl<R: Read, W: Write> CommandChannel<R, W> {
    /// Build a channel over an arbitrary pair of byte streams
    pub fn new(reader: R, writer: W, config: &ChannelConfig) -> Self {
        Self {
            reader: FrameReader::with_max_frame_len(reader, config.max_frame_len),
            writer: FrameWriter::new(writer),
            state: SessionState::Open,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send a command and block until its reply is decoded
    ///
    /// Fails with [`ProtocolError::ConnectionClosed`] if the peer closes the stream
    /// first. A timeout also closes the channel, because a late reply would
    /// otherwise be taken as the answer to the next command.
    pub fn send(&mut self, command: &str, argument: Value) -> Result<Value, ProtocolError> {
        self.transmit(command, argument)?;
        let reply = self.reader.decode::<Value>();
        match reply {
            Ok(Frame::Item(value)) => Ok(value),
            Ok(Frame::EndOfStream) => {
                self.state = SessionState::Closed;
                Err(ProtocolError::ConnectionClosed)
            }
            Err(e @ ProtocolError::MalformedMessage(_)) => Err(e),
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Send a command that gets no reply, after which the channel is unusable
    pub fn send_final(&mut self, command: &str, argument: Value) -> Result<(), ProtocolError> {
        let sent = self.transmit(command, argument);
        self.state = SessionState::Closed;
        sent
    }

    fn transmit(&mut self, command: &str, argument: Value) -> Result<(), ProtocolError> {
        if self.state != SessionState::Open {
            return Err(ProtocolError::ConnectionClosed);
        }
        debug!("sending command {command}");
        let message = Message::new(command, argument);
        self.writer.write(&message).inspect_err(|_| {
            self.state = SessionState::Closed;
        })
    }
}

/// Responding end of a session: receives one command at a time and replies to it
pub struct Responder<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    state: SessionState,
}

impl Responder<TcpStream, TcpStream> {
    /// Wrap an accepted stream
    pub fn from_tcp(stream: TcpStream, config: &ChannelConfig) -> Result<Self, ProtocolError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(config.read_timeout)?;
        let reader = stream.try_clone()?;
        Ok(Self::new(reader, stream, config))
    }
}

impl<R: Read, W: Write> Responder<R, W> {
    pub fn new(reader: R, writer: W, config: &ChannelConfig) -> Self {
        Self {
            reader: FrameReader::with_max_frame_len(reader, config.max_frame_len),
            writer: FrameWriter::new(writer),
            state: SessionState::Open,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Block until the next command arrives
    ///
    /// Once the session has ended this returns [`Incoming::SessionEnded`] again
    /// without touching the stream. A malformed frame is reported as an error but
    /// leaves the session open; a timeout leaves it open too and may be retried.
    pub fn receive_one(&mut self) -> Result<Incoming, ProtocolError> {
        if self.state == SessionState::Closed {
            return Ok(Incoming::SessionEnded);
        }
        match self.reader.decode::<Message>() {
            Ok(Frame::Item(message)) => {
                debug!("received command {}", message.command);
                Ok(Incoming::Command(message))
            }
            Ok(Frame::EndOfStream) => {
                self.state = SessionState::Closed;
                Ok(Incoming::SessionEnded)
            }
            Err(e @ (ProtocolError::MalformedMessage(_) | ProtocolError::Timeout)) => Err(e),
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Send the reply to the command most recently received
    pub fn reply_with(&mut self, value: &Value) -> Result<(), ProtocolError> {
        if self.state == SessionState::Closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.writer.write(value).inspect_err(|_| {
            self.state = SessionState::Closed;
        })
    }

    /// Stop serving this session
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use serde_json::json;

    use super::*;
    use crate::codec::{encode, tests::ScriptedReader};

    fn replies(values: &[Value]) -> Vec<u8> {
        values.iter().flat_map(|v| encode(v).unwrap()).collect()
    }

    #[test]
    fn send_returns_bare_reply() {
        let input = replies(&[json!(["up", "down"])]);
        let mut channel = CommandChannel::new(&input[..], Vec::new(), &ChannelConfig::default());

        let reply = channel.send("GET_ACTIONSPACE", Value::Null).unwrap();
        assert_eq!(reply, json!(["up", "down"]));
        assert_eq!(
            channel.writer.get_ref().as_slice(),
            b"{\"cmd\":\"GET_ACTIONSPACE\",\"arg\":null}\n"
        );
        assert_eq!(channel.state(), SessionState::Open);
    }

    #[test]
    fn send_fails_when_peer_closes_before_reply() {
        let mut channel = CommandChannel::new(io::empty(), Vec::new(), &ChannelConfig::default());
        assert!(matches!(
            channel.send("RESET", Value::Null),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert_eq!(channel.state(), SessionState::Closed);
        assert!(
            matches!(channel.send("RESET", Value::Null), Err(ProtocolError::ConnectionClosed)),
            "Closed channel refuses further sends"
        );
    }

    #[test]
    fn final_send_closes_channel() {
        let mut channel = CommandChannel::new(io::empty(), Vec::new(), &ChannelConfig::default());
        channel.send_final("KILL", Value::Null).unwrap();
        assert_eq!(channel.state(), SessionState::Closed);
        assert!(matches!(
            channel.send("RESET", Value::Null),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn timeout_closes_initiating_channel() {
        let reader = ScriptedReader::new(vec![Err(io::Error::from(io::ErrorKind::TimedOut))]);
        let mut channel = CommandChannel::new(reader, Vec::new(), &ChannelConfig::default());
        assert!(matches!(
            channel.send("RESET", Value::Null),
            Err(ProtocolError::Timeout)
        ));
        assert_eq!(channel.state(), SessionState::Closed);
    }

    #[test]
    fn responder_sees_commands_then_session_end() {
        let input: Vec<u8> = [
            Message::new("RESET", Value::Null),
            Message::new("STEP", json!("up")),
        ]
        .iter()
        .flat_map(|m| encode(m).unwrap())
        .collect();
        let mut responder = Responder::new(&input[..], Vec::new(), &ChannelConfig::default());

        let first = responder.receive_one().unwrap();
        assert_eq!(first, Incoming::Command(Message::new("RESET", Value::Null)));
        responder.reply_with(&json!({"x": 0})).unwrap();

        let second = responder.receive_one().unwrap();
        assert_eq!(second, Incoming::Command(Message::new("STEP", json!("up"))));

        assert_eq!(responder.receive_one().unwrap(), Incoming::SessionEnded);
        assert_eq!(responder.state(), SessionState::Closed);
        assert_eq!(
            responder.receive_one().unwrap(),
            Incoming::SessionEnded,
            "Ended session stays ended"
        );
    }

    #[test]
    fn responder_survives_malformed_frame() {
        let input = b"{\"arg\":1}\n{\"cmd\":\"CLOSE\"}\n";
        let mut responder = Responder::new(&input[..], Vec::new(), &ChannelConfig::default());
        assert!(matches!(
            responder.receive_one(),
            Err(ProtocolError::MalformedMessage(_))
        ));
        assert_eq!(responder.state(), SessionState::Open);
        assert_eq!(
            responder.receive_one().unwrap(),
            Incoming::Command(Message::new("CLOSE", Value::Null))
        );
    }
}
