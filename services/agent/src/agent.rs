//! Backend side of the control protocol.
//!
//! ## Architecture
//!
//! - **Registration**: binds the data listener, connects to the balancer
//!   and completes the `REGISTER` / `SANITY` / `SANE` / `REGISTERED`
//!   handshake before anything else is spawned.
//! - **Connection task**: owns the control connection afterwards. Sends
//!   `HEALTH` on a fixed interval, executes pause/resume/deregister
//!   requests from the [`AgentHandle`] and matches replies to requests in
//!   order.
//! - **Data task**: delivers every datagram received on the data listener
//!   to the application.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use fluxlb_proto::{parse_sanity_probe, Reply, Request, HEALTH_OK};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::AgentConfig;
use crate::error::AgentError;

/// Datagrams buffered for the application.
pub const DATA_QUEUE_DEPTH: usize = 1024;

const MAX_DATAGRAM: usize = 65_535;

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unregistered,
    Registering,
    Active,
    Paused,
    Deregistering,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deregistering => "deregistering",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Pause,
    Resume,
    Deregister,
}

impl Operation {
    fn request(self) -> Request {
        match self {
            Self::Pause => Request::Pause,
            Self::Resume => Request::Resume,
            Self::Deregister => Request::Deregister,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Deregister => "deregister",
        }
    }

    fn allowed_in(self, state: AgentState) -> bool {
        match self {
            Self::Pause => state == AgentState::Active,
            Self::Resume => state == AgentState::Paused,
            Self::Deregister => matches!(state, AgentState::Active | AgentState::Paused),
        }
    }
}

type Responder = oneshot::Sender<Result<(), AgentError>>;

struct Command {
    operation: Operation,
    respond: Responder,
}

/// A request awaiting its reply.
enum Pending {
    Health,
    Operation(Operation, Option<Responder>),
}

/// Handle to a registered agent.
///
/// Dropping the handle deregisters the backend.
pub struct AgentHandle {
    name: String,
    data_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<AgentState>,
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound data listener address.
    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Ask the balancer to stop routing to this backend.
    pub async fn pause(&self) -> Result<(), AgentError> {
        self.request(Operation::Pause).await
    }

    /// Ask the balancer to route to this backend again.
    pub async fn resume(&self) -> Result<(), AgentError> {
        self.request(Operation::Resume).await
    }

    /// Leave the balancer and close the control connection.
    pub async fn deregister(&self) -> Result<(), AgentError> {
        self.request(Operation::Deregister).await
    }

    /// Wait until the agent is no longer registered.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        wait_unregistered(&mut state).await;
    }

    async fn request(&self, operation: Operation) -> Result<(), AgentError> {
        let (respond, response) = oneshot::channel();
        self.commands
            .send(Command { operation, respond })
            .await
            .map_err(|_| AgentError::Closed)?;
        response.await.map_err(|_| AgentError::Closed)?
    }
}

/// Register with the balancer.
///
/// Returns once the balancer confirmed the registration. Data received
/// afterwards arrives on the returned receiver.
pub async fn register(
    config: AgentConfig,
) -> Result<(AgentHandle, mpsc::Receiver<Bytes>), AgentError> {
    let data_addr = config.data_addr();
    let socket = UdpSocket::bind(data_addr)
        .await
        .map_err(|source| AgentError::Bind {
            addr: data_addr,
            source,
        })?;
    let data_addr = socket.local_addr()?;

    let stream = TcpStream::connect(config.balancer_addr)
        .await
        .map_err(|source| AgentError::Connect {
            addr: config.balancer_addr,
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let (read, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    info!(
        backend = %config.name,
        balancer_addr = %config.balancer_addr,
        data_addr = %data_addr,
        "Registering with balancer"
    );

    let register = Request::Register {
        name: config.name.clone(),
        address: config.data_ip,
    };
    write_line(&mut writer, &register, config.write_timeout).await?;

    let nonce = timeout(config.read_timeout, await_sanity_probe(&socket, &mut lines))
        .await
        .map_err(|_| AgentError::SanityTimeout(config.read_timeout))??;
    trace!(backend = %config.name, "Sanity probe received");

    write_line(&mut writer, &Request::Sane { nonce }, config.write_timeout).await?;

    match read_reply(&mut lines, config.read_timeout).await? {
        Reply::Registered { .. } => {}
        Reply::Invalid(reason) => return Err(AgentError::Rejected(reason)),
        other => return Err(AgentError::UnexpectedReply(other.to_string())),
    }

    info!(backend = %config.name, "Registered with balancer");

    let (state_tx, state_rx) = watch::channel(AgentState::Active);
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_DEPTH);

    let connection = Connection {
        lines,
        writer,
        state: state_tx,
        health_interval: config.health_interval,
        write_timeout: config.write_timeout,
    };
    tokio::spawn(
        connection
            .run(commands_rx)
            .instrument(info_span!("agent", backend = %config.name)),
    );
    tokio::spawn(
        receive_data(socket, data_tx, state_rx.clone())
            .instrument(info_span!("agent_data", backend = %config.name)),
    );

    Ok((
        AgentHandle {
            name: config.name,
            data_addr,
            commands: commands_tx,
            state: state_rx,
        },
        data_rx,
    ))
}

/// Wait for `SANITY <nonce>` on the data path. A control line arriving
/// first ends the handshake.
async fn await_sanity_probe(
    socket: &UdpSocket,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) -> Result<String, AgentError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received?;
                match parse_sanity_probe(&buf[..len]) {
                    Some(nonce) => return Ok(nonce.to_string()),
                    None => debug!(peer_addr = %peer, "Ignoring datagram before registration"),
                }
            }
            line = lines.next_line() => {
                let line = line?.ok_or(AgentError::Closed)?;
                return Err(match Reply::decode(&line) {
                    Ok(Reply::Invalid(reason)) => AgentError::Rejected(reason),
                    _ => AgentError::UnexpectedReply(line),
                });
            }
        }
    }
}

async fn read_reply(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    limit: Duration,
) -> Result<Reply, AgentError> {
    let line = timeout(limit, lines.next_line())
        .await
        .map_err(|_| AgentError::Timeout(limit))??
        .ok_or(AgentError::Closed)?;
    Reply::decode(&line).map_err(|_| AgentError::UnexpectedReply(line))
}

async fn write_line<M: fmt::Display>(
    writer: &mut OwnedWriteHalf,
    message: &M,
    limit: Duration,
) -> Result<(), AgentError> {
    let frame = format!("{}\n", message);
    timeout(limit, writer.write_all(frame.as_bytes()))
        .await
        .map_err(|_| AgentError::Timeout(limit))??;
    Ok(())
}

async fn wait_unregistered(state: &mut watch::Receiver<AgentState>) {
    let _ = state.wait_for(|s| *s == AgentState::Unregistered).await;
}

/// Control connection after registration.
struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    state: watch::Sender<AgentState>,
    health_interval: Duration,
    write_timeout: Duration,
}

impl Connection {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut health = interval_at(Instant::now() + self.health_interval, self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending = VecDeque::new();
        let mut handle_dropped = false;

        let result = loop {
            tokio::select! {
                _ = health.tick() => {
                    let check = Request::Health { code: HEALTH_OK.to_string() };
                    if let Err(e) = write_line(&mut self.writer, &check, self.write_timeout).await {
                        break Err(e);
                    }
                    pending.push_back(Pending::Health);
                }

                command = commands.recv(), if !handle_dropped => {
                    let started = match command {
                        Some(Command { operation, respond }) => {
                            self.start(operation, Some(respond), &mut pending).await
                        }
                        None => {
                            // handle dropped: leave the balancer
                            handle_dropped = true;
                            self.start(Operation::Deregister, None, &mut pending).await
                        }
                    };
                    if let Err(e) = started {
                        break Err(e);
                    }
                }

                line = self.lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if self.handle_reply(&line, &mut pending) {
                                break Ok(());
                            }
                        }
                        Ok(None) => break Err(AgentError::Closed),
                        Err(e) => break Err(e.into()),
                    }
                }
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Control connection lost");
        }
        self.state.send_replace(AgentState::Unregistered);
        // remaining responders are dropped and their callers see Closed
    }

    fn current(&self) -> AgentState {
        *self.state.borrow()
    }

    async fn start(
        &mut self,
        operation: Operation,
        respond: Option<Responder>,
        pending: &mut VecDeque<Pending>,
    ) -> Result<(), AgentError> {
        let state = self.current();
        if !operation.allowed_in(state) {
            if let Some(respond) = respond {
                let _ = respond.send(Err(AgentError::InvalidState {
                    operation: operation.name(),
                    state,
                }));
            }
            return Ok(());
        }

        write_line(&mut self.writer, &operation.request(), self.write_timeout).await?;
        if operation == Operation::Deregister {
            self.state.send_replace(AgentState::Deregistering);
        }
        pending.push_back(Pending::Operation(operation, respond));
        Ok(())
    }

    /// Apply one reply. Returns `true` once the balancer ended the session.
    fn handle_reply(&mut self, line: &str, pending: &mut VecDeque<Pending>) -> bool {
        let reply = match Reply::decode(line) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, line = %line, "Unparseable reply from balancer");
                return false;
            }
        };

        if let Reply::Deregistered { reason, .. } = &reply {
            info!(reason = %reason, "Deregistered by balancer");
            self.state.send_replace(AgentState::Unregistered);

            for waiting in pending.drain(..) {
                if let Pending::Operation(operation, Some(respond)) = waiting {
                    let result = match operation {
                        Operation::Deregister => Ok(()),
                        _ => Err(AgentError::Closed),
                    };
                    let _ = respond.send(result);
                }
            }
            return true;
        }

        match pending.pop_front() {
            Some(Pending::Health) => match reply {
                Reply::HealthAck(code) => trace!(code, "Health check acknowledged"),
                other => warn!(reply = %other, "Unexpected reply to health check"),
            },
            Some(Pending::Operation(operation, respond)) => {
                let result = match (operation, reply) {
                    (Operation::Pause, Reply::Paused(_)) => {
                        self.state.send_replace(AgentState::Paused);
                        info!("Backend paused");
                        Ok(())
                    }
                    (Operation::Resume, Reply::Resumed(_)) => {
                        self.state.send_replace(AgentState::Active);
                        info!("Backend resumed");
                        Ok(())
                    }
                    (_, Reply::Invalid(reason)) => Err(AgentError::Rejected(reason)),
                    (_, other) => Err(AgentError::UnexpectedReply(other.to_string())),
                };
                if let Some(respond) = respond {
                    let _ = respond.send(result);
                }
            }
            None => warn!(reply = %reply, "Unsolicited reply from balancer"),
        }

        false
    }
}

/// Deliver data-path datagrams until the agent is unregistered.
async fn receive_data(
    socket: UdpSocket,
    data: mpsc::Sender<Bytes>,
    mut state: watch::Receiver<AgentState>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = wait_unregistered(&mut state) => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => {
                    if data.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                        trace!("Data receiver dropped, discarding datagram");
                    }
                }
                Err(e) => warn!(error = %e, "Data receive error"),
            },
        }
    }

    debug!("Data listener closed");
}
