use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use serde_json::Value;

use crate::{
    channel::{ChannelConfig, Incoming, Responder},
    codec::{Message, DEFAULT_MAX_FRAME_LEN},
    error::ProtocolError,
    protocol::{error_reply, Command},
};

/// Interprets the commands received by a [`CommandServer`]
///
/// Errors are sent back to the peer as error replies; they never stop the server.
/// Closures of the right shape are interpreters too.
pub trait Interpreter {
    fn handle(&mut self, command: Command, argument: Value) -> Result<Value, ProtocolError>;

    /// Called when the peer sends KILL, right before the server stops
    fn on_kill(&mut self) {}
}

impl<F> Interpreter for F
where
    F: FnMut(Command, Value) -> Result<Value, ProtocolError>,
{
    fn handle(&mut self, command: Command, argument: Value) -> Result<Value, ProtocolError> {
        self(command, argument)
    }
}

/// Configuration for [`CommandServer`]
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Frames larger than this are answered with a malformed-message error
    pub max_frame_len: usize,
    /// How often blocked accepts and receives check for shutdown
    pub poll_interval: Duration,
    /// End a session whose peer has been silent this long; `None` waits forever
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            poll_interval: Duration::from_millis(50),
            idle_timeout: None,
        }
    }
}

/// Requests a running server to stop
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a served session finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The peer disconnected
    Ended,
    /// The peer sent KILL
    Killed,
    /// The server was shut down through its [`ShutdownHandle`]
    Cancelled,
    /// The peer stayed silent past the idle timeout
    IdleTimeout,
    /// The session broke on a transport error, e.g. the peer vanished mid-frame
    Aborted,
}

/// Single-connection command server
///
/// Accepts one peer at a time and loops receive, interpret, reply until the peer
/// disconnects.
pub struct CommandServer {
    listener: TcpListener,
    config: ServerConfig,
    shutdown: ShutdownHandle,
}

impl CommandServer {
    pub fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("command server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config,
            shutdown: ShutdownHandle::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept exactly one connection and serve it to the end
    ///
    /// Transport failures inside the session end it with [`SessionOutcome::Aborted`];
    /// only a failing listener is returned as an error.
    pub fn serve_once<I: Interpreter + ?Sized>(
        &self,
        interpreter: &mut I,
    ) -> Result<SessionOutcome, ProtocolError> {
        let Some((stream, peer)) = self.accept()? else {
            info!("shutdown requested while waiting for a connection");
            return Ok(SessionOutcome::Cancelled);
        };
        info!("connected by {peer}");
        let outcome = self
            .serve_session(stream, interpreter)
            .unwrap_or_else(|e| {
                warn!("session with {peer} aborted: {e}");
                SessionOutcome::Aborted
            });
        info!("session with {peer} finished: {outcome:?}");
        Ok(outcome)
    }

    /// Serve connections one after another until KILL or shutdown
    pub fn serve<I: Interpreter + ?Sized>(
        &self,
        interpreter: &mut I,
    ) -> Result<SessionOutcome, ProtocolError> {
        loop {
            match self.serve_once(interpreter)? {
                SessionOutcome::Ended | SessionOutcome::IdleTimeout | SessionOutcome::Aborted => {
                    continue
                }
                outcome => return Ok(outcome),
            }
        }
    }

    /// Run [`serve_once`](Self::serve_once) on a dedicated thread
    ///
    /// The interpreter is handed back when the session finishes.
    pub fn spawn<I>(
        self,
        mut interpreter: I,
    ) -> JoinHandle<Result<(SessionOutcome, I), ProtocolError>>
    where
        I: Interpreter + Send + 'static,
    {
        thread::spawn(move || {
            let outcome = self.serve_once(&mut interpreter)?;
            Ok((outcome, interpreter))
        })
    }

    fn accept(&self) -> Result<Option<(TcpStream, SocketAddr)>, ProtocolError> {
        loop {
            if self.shutdown.is_shutdown() {
                return Ok(None);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Some((stream, peer)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.poll_interval)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn serve_session<I: Interpreter + ?Sized>(
        &self,
        stream: TcpStream,
        interpreter: &mut I,
    ) -> Result<SessionOutcome, ProtocolError> {
        let channel = ChannelConfig {
            read_timeout: Some(self.config.poll_interval),
            max_frame_len: self.config.max_frame_len,
        };
        let mut responder = Responder::from_tcp(stream, &channel)?;
        let mut last_heard = Instant::now();

        loop {
            if self.shutdown.is_shutdown() {
                responder.close();
                return Ok(SessionOutcome::Cancelled);
            }
            match responder.receive_one() {
                Ok(Incoming::SessionEnded) => {
                    info!("the client left");
                    return Ok(SessionOutcome::Ended);
                }
                Ok(Incoming::Command(message)) => {
                    last_heard = Instant::now();
                    if let Some(outcome) = dispatch(&mut responder, interpreter, message)? {
                        responder.close();
                        return Ok(outcome);
                    }
                }
                Err(ProtocolError::Timeout) => {
                    if let Some(limit) = self.config.idle_timeout {
                        if last_heard.elapsed() >= limit {
                            warn!("no command for {:?}, ending the session", limit);
                            responder.close();
                            return Ok(SessionOutcome::IdleTimeout);
                        }
                    }
                }
                Err(e @ ProtocolError::MalformedMessage(_)) => {
                    last_heard = Instant::now();
                    warn!("{e}");
                    responder.reply_with(&error_reply(&e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Route one message to the interpreter and send its reply
///
/// **Returns** an outcome when the session must stop.
fn dispatch<R, W, I>(
    responder: &mut Responder<R, W>,
    interpreter: &mut I,
    message: Message,
) -> Result<Option<SessionOutcome>, ProtocolError>
where
    R: io::Read,
    W: io::Write,
    I: Interpreter + ?Sized,
{
    let command = match Command::from_str(&message.command) {
        Ok(command) => command,
        Err(_) => {
            let err = ProtocolError::UnknownCommand(message.command);
            warn!("{err}");
            responder.reply_with(&error_reply(&err))?;
            return Ok(None);
        }
    };

    if command == Command::Kill {
        info!("KILL received, stopping the server");
        interpreter.on_kill();
        return Ok(Some(SessionOutcome::Killed));
    }

    debug!("interpreting {command} {}", message.argument);
    let reply = interpreter
        .handle(command, message.argument)
        .unwrap_or_else(|e| {
            warn!("{command} failed: {e}");
            error_reply(&e)
        });
    responder.reply_with(&reply)?;
    Ok(None)
}
