use flare::error::WireError;
use flare::logging::{self, Logger};
use flare::proto::{self, Frame, Reply};
use flare::wire;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::{Action, ConnState, Engine};
use crate::session::ConnId;
use crate::{BrokerError, Command};

const LISTENER: Token = Token(0);
/// Poll deadline; bounds how long a shutdown request can go unnoticed.
const POLL_DEADLINE: Duration = Duration::from_millis(500);
/// How long a single frame write may stall before the peer is evicted.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(1);
const EVENT_CAPACITY: usize = 256;

/// A live client connection and its authentication state.
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
}

/// Handles all connection management and frame transmission. Connection
/// slots are reused through a free list; slot `n` maps to poll token
/// `n + 1`, with token 0 reserved for the listener.
pub struct Endpoint {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    conns: Vec<Option<Connection>>,
    free: Vec<ConnId>,
    engine: Engine,
    log: Logger,
}

impl Endpoint {
    pub fn new(mut listener: TcpListener, engine: Engine, log: &Logger) -> io::Result<Endpoint> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Endpoint {
            listener,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            conns: Vec::new(),
            free: Vec::new(),
            engine,
            log: log.new(logging::o!()),
        })
    }

    /// One pass of the loop: wait for readiness, accept pending sockets and
    /// service every readable connection.
    pub fn pump(&mut self) {
        if let Err(err) = self.poll.poll(&mut self.events, Some(POLL_DEADLINE)) {
            if err.kind() == io::ErrorKind::Interrupted {
                return;
            }
            panic!("Server poll failed: {}", err);
        }

        let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();

        for token in ready {
            match token {
                LISTENER => self.accept_pending(),
                Token(slot) => self.service_connection(slot - 1),
            }
        }
    }

    /// Applies one operator command from the control handle.
    pub fn execute(&mut self, command: Command) {
        match command {
            Command::RegisterUser {
                login,
                password_hash,
                reply,
            } => {
                let result = self
                    .engine
                    .store()
                    .register_user(&login, &password_hash)
                    .map_err(BrokerError::from);
                drop(reply.send(result));
            }
            Command::RemoveUser { login, reply } => {
                if let Some(id) = self.engine.session_of(&login) {
                    self.evict(id);
                }
                let result = self
                    .engine
                    .store_mut()
                    .remove_user(&login)
                    .map_err(BrokerError::from);
                self.broadcast(&Frame::Reply(Reply::refresh()));
                drop(reply.send(result));
            }
            Command::ChangePassword {
                login,
                password_hash,
                reply,
            } => {
                if let Some(id) = self.engine.session_of(&login) {
                    self.evict(id);
                }
                let result = self
                    .engine
                    .store()
                    .change_password(&login, &password_hash)
                    .map_err(BrokerError::from);
                self.broadcast(&Frame::Reply(Reply::refresh()));
                drop(reply.send(result));
            }
            Command::BroadcastRosterChanged => {
                self.broadcast(&Frame::Reply(Reply::refresh()));
            }
            Command::ListActiveUsers { reply } => {
                drop(reply.send(self.engine.store().active_users().map_err(BrokerError::from)));
            }
            Command::ListAllUsers { reply } => {
                drop(reply.send(self.engine.store().all_users().map_err(BrokerError::from)));
            }
            Command::LoginHistory { login, reply } => {
                let result = self
                    .engine
                    .store()
                    .login_history(login.as_deref())
                    .map_err(BrokerError::from);
                drop(reply.send(result));
            }
            Command::MessageCounters { reply } => {
                drop(
                    reply.send(self.engine.store().message_counters().map_err(BrokerError::from)),
                );
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.open_connection(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn open_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        };

        if let Err(err) =
            self.poll
                .registry()
                .register(&mut stream, Token(id + 1), Interest::READABLE)
        {
            logging::error!(self.log, "stream registration failed"; "peer" => %peer, "error" => %err);
            self.free.push(id);
            return;
        }

        logging::info!(self.log, "connection accepted"; "conn" => id, "peer" => %peer);

        self.conns[id] = Some(Connection {
            stream,
            peer,
            state: ConnState::Unauth,
        });
    }

    /// Reads frames off a readable connection until it would block. The
    /// poll is edge-triggered, so the socket must be drained here.
    fn service_connection(&mut self, id: ConnId) {
        loop {
            let Some(conn) = self.conns.get_mut(id).and_then(Option::as_mut) else {
                // Evicted while handling an earlier frame of this batch.
                return;
            };

            let mut buf = [0u8; wire::MAX_FRAME_SIZE];
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    logging::info!(self.log, "peer closed connection"; "conn" => id);
                    self.evict(id);
                    return;
                }
                Ok(count) => self.handle_bytes(id, &buf[..count]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::info!(self.log, "read failed"; "conn" => id, "error" => %err);
                    self.evict(id);
                    return;
                }
            }
        }
    }

    fn handle_bytes(&mut self, id: ConnId, bytes: &[u8]) {
        let frame = match wire::decode(bytes) {
            Ok(frame) => frame,
            Err(WireError::UnknownShape) => {
                logging::debug!(self.log, "unrecognised frame shape"; "conn" => id);
                let reply = Frame::Reply(Reply::error(proto::ERR_BAD_REQUEST));
                if !self.write_frame_to(id, &reply) {
                    self.evict(id);
                }
                return;
            }
            Err(err) => {
                logging::info!(self.log, "malformed frame"; "conn" => id, "error" => %err);
                self.evict(id);
                return;
            }
        };

        let actions = {
            let conn = self.conns[id].as_mut().expect("Connection must be live");
            let peer = conn.peer;
            self.engine.handle_frame(id, peer, &mut conn.state, frame, bytes)
        };

        self.apply(actions);
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Reply(dest, frame) => {
                    if !self.write_frame_to(dest, &frame) {
                        self.evict(dest);
                    }
                }
                Action::Forward(dest, raw) => {
                    if !self.write_raw_to(dest, &raw) {
                        self.evict(dest);
                    }
                }
                Action::Close(dest) => self.evict(dest),
                Action::Broadcast(frame) => self.broadcast(&frame),
            }
        }
    }

    /// Writes one frame to every authenticated connection, evicting those
    /// that cannot be written to.
    fn broadcast(&mut self, frame: &Frame) {
        let bytes = match wire::encode(frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                logging::error!(self.log, "broadcast frame rejected"; "error" => %err);
                return;
            }
        };

        let targets: Vec<ConnId> = self
            .conns
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| match slot {
                Some(conn) if matches!(conn.state, ConnState::Authenticated { .. }) => Some(id),
                _ => None,
            })
            .collect();

        for id in targets {
            if !self.write_raw_to(id, &bytes) {
                self.evict(id);
            }
        }
    }

    /// Returns false if the frame could not be written; oversize frames are
    /// dropped with a diagnostic rather than taking the connection down.
    fn write_frame_to(&mut self, id: ConnId, frame: &Frame) -> bool {
        match wire::encode(frame) {
            Ok(bytes) => self.write_raw_to(id, &bytes),
            Err(err) => {
                logging::error!(self.log, "reply frame rejected"; "conn" => id, "error" => %err);
                true
            }
        }
    }

    fn write_raw_to(&mut self, id: ConnId, bytes: &[u8]) -> bool {
        let Some(conn) = self.conns.get_mut(id).and_then(Option::as_mut) else {
            return true;
        };

        match write_with_deadline(&mut conn.stream, bytes) {
            Ok(()) => true,
            Err(err) => {
                logging::info!(self.log, "write failed"; "conn" => id, "error" => %err);
                false
            }
        }
    }

    /// Removes a connection: deregisters the stream, releases the login
    /// binding and returns the slot to the free list. The socket closes
    /// when the connection drops.
    fn evict(&mut self, id: ConnId) {
        let Some(mut conn) = self.conns.get_mut(id).and_then(Option::take) else {
            return;
        };

        if let Err(err) = self.poll.registry().deregister(&mut conn.stream) {
            logging::debug!(self.log, "stream deregistration failed"; "conn" => id, "error" => %err);
        }

        self.engine.connection_closed(&conn.state);
        logging::info!(self.log, "connection evicted"; "conn" => id, "peer" => %conn.peer);

        self.free.push(id);
    }
}

/// Writes the whole frame, retrying `WouldBlock` for up to the write
/// deadline. Frames are small, so a peer that stays unwritable this long is
/// treated as dead.
fn write_with_deadline(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    let started = Instant::now();
    let mut written = 0;

    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(count) => written += count,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if started.elapsed() >= WRITE_DEADLINE {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                thread::sleep(WRITE_RETRY_PAUSE);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(())
}
