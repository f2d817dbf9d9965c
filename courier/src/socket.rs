use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flare::crypto;
use flare::error::{self, ServerError, WireError};
use flare::keys::KeyPair;
use flare::logging::{self, Logger};
use flare::proto::{self, Frame, Reply, Request};
use flare::wire;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::{ClientEvent, InboundMessage};
use crate::store::{ClientStore, Direction};

const CONNECT_ATTEMPTS: usize = 5;
const CONNECT_PAUSE: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Socket timeout outside the receive loop's probe window.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Short probe timeout used by the receive loop so the socket lock is
/// never held for long.
const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(500);
const RECEIVE_PAUSE: Duration = Duration::from_secs(1);
/// Grace period on shutdown so the server sees the exit frame.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const MUTEX_POISONED: &str = "Socket mutex poisoned";

fn must<T>(result: rusqlite::Result<T>, context: &str) -> T {
    result.unwrap_or_else(|err| panic!("Fatal client store failure during {}: {}", context, err))
}

/// State shared between the caller's thread and the receive thread. The
/// stream mutex guards the socket and the request/response pairing: a
/// request and its reply travel under one lock hold, so the pair cannot
/// interleave with the background read.
#[derive(Debug)]
struct Core {
    nickname: String,
    store: ClientStore,
    stream: Mutex<TcpStream>,
    running: AtomicBool,
    log: Logger,
}

impl Core {
    fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<(), ServerError> {
        let bytes = wire::encode(frame).map_err(|err| ServerError::new(err.to_string()))?;
        stream
            .write_all(&bytes)
            .map_err(|_| ServerError::new(error::CONNECTION_LOST))
    }

    fn read_frame(stream: &mut TcpStream) -> Result<Frame, ServerError> {
        let mut buf = [0u8; wire::MAX_FRAME_SIZE];
        let count = stream
            .read(&mut buf)
            .map_err(|_| ServerError::new(error::CONNECTION_LOST))?;

        if count == 0 {
            return Err(ServerError::new(error::CONNECTION_LOST));
        }

        wire::decode(&buf[..count]).map_err(|err| ServerError::new(err.to_string()))
    }

    /// Sends one frame and reads the server's next frame under a single
    /// lock hold.
    fn send_then_receive(&self, request: &Frame) -> Result<Frame, ServerError> {
        let mut stream = self.stream.lock().expect(MUTEX_POISONED);

        Core::write_frame(&mut stream, request)?;
        Core::read_frame(&mut stream)
    }

    /// Runs the presence/challenge/answer exchange. A `400` during any step
    /// surfaces the server's own error text.
    fn authorize(&self, password_hash: &str, pubkey: &str) -> Result<(), ServerError> {
        let mut stream = self.stream.lock().expect(MUTEX_POISONED);

        logging::debug!(self.log, "starting authorization"; "login" => %self.nickname);
        Core::write_frame(
            &mut stream,
            &Frame::Request(Request::presence(&self.nickname, pubkey)),
        )?;

        let challenge = match Core::read_frame(&mut stream)? {
            Frame::Reply(reply) if reply.response == proto::AUTH_PAYLOAD => {
                reply.bin.unwrap_or_default()
            }
            Frame::Reply(reply) if reply.response == proto::BAD_REQUEST => {
                return Err(ServerError::new(reply.error.unwrap_or_default()));
            }
            other => {
                logging::error!(self.log, "unexpected authorization reply"; "frame" => ?other);
                return Err(ServerError::new(error::CONNECTION_LOST));
            }
        };

        let answer = crypto::challenge_answer(password_hash, &challenge);
        Core::write_frame(
            &mut stream,
            &Frame::Reply(Reply::auth(BASE64.encode(answer))),
        )?;

        match Core::read_frame(&mut stream)? {
            Frame::Reply(reply) if reply.response == proto::OK => {
                logging::info!(self.log, "authorized"; "login" => %self.nickname);
                Ok(())
            }
            Frame::Reply(reply) if reply.response == proto::BAD_REQUEST => {
                Err(ServerError::new(reply.error.unwrap_or_default()))
            }
            other => {
                logging::error!(self.log, "unexpected authorization reply"; "frame" => ?other);
                Err(ServerError::new(error::CONNECTION_LOST))
            }
        }
    }

    /// Clears the local contact list and refills it from the server. A
    /// reply of the wrong shape is logged and leaves the list empty.
    fn request_contacts(&self) -> Result<(), ServerError> {
        must(self.store.clear_contacts(), "contact reset");

        let request = Frame::Request(Request::get_contacts(&self.nickname));
        match self.send_then_receive(&request)? {
            Frame::Reply(reply) if reply.response == proto::LIST => {
                for contact in reply.data_list.unwrap_or_default() {
                    must(self.store.add_contact(&contact), "contact insert");
                }
                Ok(())
            }
            other => {
                logging::error!(self.log, "contact list refresh failed"; "frame" => ?other);
                Ok(())
            }
        }
    }

    /// Replaces the known-user mirror with the server's roster.
    fn request_users(&self) -> Result<(), ServerError> {
        let request = Frame::Request(Request::get_users(&self.nickname));
        match self.send_then_receive(&request)? {
            Frame::Reply(reply) if reply.response == proto::LIST => {
                must(
                    self.store.replace_known_users(&reply.data_list.unwrap_or_default()),
                    "user list replace",
                );
                Ok(())
            }
            other => {
                logging::error!(self.log, "user list refresh failed"; "frame" => ?other);
                Ok(())
            }
        }
    }

    fn refresh_rosters(&self) {
        if let Err(err) = self.request_users() {
            logging::error!(self.log, "user list refresh failed"; "error" => %err);
        }
        if let Err(err) = self.request_contacts() {
            logging::error!(self.log, "contact list refresh failed"; "error" => %err);
        }
    }

    /// Interprets a direct reply to a fire-and-forget request: only a 400
    /// surfaces to the caller.
    fn expect_ok(&self, frame: Frame) -> Result<(), ServerError> {
        match frame {
            Frame::Reply(reply) if reply.response == proto::OK => Ok(()),
            Frame::Reply(reply) if reply.response == proto::BAD_REQUEST => Err(ServerError::new(
                format!("400: {}", reply.error.unwrap_or_default()),
            )),
            other => {
                logging::debug!(self.log, "unexpected reply"; "frame" => ?other);
                Ok(())
            }
        }
    }
}

/// Handle to the connected client core. Methods are called from the UI
/// thread; the paired receive thread pushes [`ClientEvent`]s.
#[derive(Debug)]
pub struct Courier {
    core: Arc<Core>,
    reader: Option<JoinHandle<()>>,
}

impl Courier {
    /// Opens the connection, authenticates and primes the local store with
    /// the server's contact and user lists. On success the receive thread
    /// is running and the returned channel delivers its events.
    pub fn connect<'a, L>(
        address: &str,
        port: u16,
        nickname: &str,
        password: &str,
        keys: &KeyPair,
        store: ClientStore,
        log: L,
    ) -> Result<(Courier, mpsc::Receiver<ClientEvent>), ServerError>
    where
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let stream = establish(address, port, &log)?;
        let pubkey = keys
            .public_pem()
            .map_err(|err| ServerError::new(err.to_string()))?;
        let password_hash = crypto::password_hash(password, nickname);

        let core = Core {
            nickname: nickname.to_owned(),
            store,
            stream: Mutex::new(stream),
            running: AtomicBool::new(true),
            log,
        };

        core.authorize(&password_hash, &pubkey)?;
        core.request_contacts()?;
        core.request_users()?;

        let core = Arc::new(core);
        let (events, inbox) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("courier-recv".to_owned())
            .spawn({
                let core = core.clone();
                move || receive_loop(core, events)
            })
            .expect("Receive thread spawn failed");

        Ok((
            Courier {
                core,
                reader: Some(reader),
            },
            inbox,
        ))
    }

    pub fn nickname(&self) -> &str {
        &self.core.nickname
    }

    /// The local store, for history display and appending sent plaintext.
    pub fn store(&self) -> &ClientStore {
        &self.core.store
    }

    /// Sends an already-encrypted message body to `peer`. The caller
    /// appends the plaintext to history once this returns Ok.
    pub fn send(&self, peer: &str, ciphertext_b64: &str) -> Result<(), ServerError> {
        let request = Frame::Request(Request::message(&self.core.nickname, peer, ciphertext_b64));
        let reply = self.core.send_then_receive(&request)?;
        self.core.expect_ok(reply)?;

        logging::info!(self.core.log, "message sent"; "to" => %peer);

        Ok(())
    }

    pub fn add_contact(&self, contact: &str) -> Result<(), ServerError> {
        logging::debug!(self.core.log, "adding contact"; "contact" => %contact);
        let reply = self
            .core
            .send_then_receive(&Frame::Request(Request::add(&self.core.nickname, contact)))?;
        self.core.expect_ok(reply)
    }

    pub fn remove_contact(&self, contact: &str) -> Result<(), ServerError> {
        logging::debug!(self.core.log, "removing contact"; "contact" => %contact);
        let reply = self.core.send_then_receive(&Frame::Request(Request::remove(
            &self.core.nickname,
            contact,
        )))?;
        self.core.expect_ok(reply)
    }

    /// The peer's public key PEM, or None if the server has none for it.
    pub fn fetch_public_key(&self, peer: &str) -> Option<String> {
        let request = Frame::Request(Request::pubkey_need(peer));
        match self.core.send_then_receive(&request) {
            Ok(Frame::Reply(reply)) if reply.response == proto::AUTH_PAYLOAD => reply.bin,
            Ok(_) | Err(_) => {
                logging::error!(self.core.log, "no public key obtained"; "login" => %peer);
                None
            }
        }
    }

    /// Refetches the contact list into the local store.
    pub fn request_contacts(&self) -> Result<(), ServerError> {
        self.core.request_contacts()
    }

    /// Refetches the known-user list into the local store.
    pub fn request_users(&self) -> Result<(), ServerError> {
        self.core.request_users()
    }

    /// Stops the receive loop, tells the server goodbye (best effort) and
    /// joins the receive thread.
    pub fn disconnect(&mut self) {
        self.core.running.store(false, Ordering::Relaxed);

        {
            let mut stream = self.core.stream.lock().expect(MUTEX_POISONED);
            drop(Core::write_frame(
                &mut stream,
                &Frame::Request(Request::exit(&self.core.nickname)),
            ));
        }

        logging::debug!(self.core.log, "client socket shutting down");
        thread::sleep(SHUTDOWN_GRACE);

        if let Some(reader) = self.reader.take() {
            drop(reader.join());
        }
    }
}

/// Opens the TCP connection, retrying a few times before giving up with
/// the user-facing connection error.
fn establish(address: &str, port: u16, log: &Logger) -> Result<TcpStream, ServerError> {
    let targets: Vec<SocketAddr> = (address, port)
        .to_socket_addrs()
        .map_err(|_| ServerError::new(error::CONNECT_FAILED))?
        .collect();

    let mut connected = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        logging::info!(log, "connection attempt"; "attempt" => attempt + 1);

        match targets
            .iter()
            .find_map(|addr| TcpStream::connect_timeout(addr, CONNECT_TIMEOUT).ok())
        {
            Some(stream) => {
                connected = Some(stream);
                break;
            }
            None => thread::sleep(CONNECT_PAUSE),
        }
    }

    let stream = connected.ok_or_else(|| {
        logging::error!(log, "{}", error::CONNECT_FAILED);
        ServerError::new(error::CONNECT_FAILED)
    })?;

    stream
        .set_read_timeout(Some(REQUEST_TIMEOUT))
        .map_err(|_| ServerError::new(error::CONNECT_FAILED))?;
    stream
        .set_write_timeout(Some(REQUEST_TIMEOUT))
        .map_err(|_| ServerError::new(error::CONNECT_FAILED))?;

    logging::debug!(log, "connection established"; "address" => %address, "port" => port);

    Ok(stream)
}

enum ReadOutcome {
    /// Nothing arrived within the probe window.
    Idle,
    /// Well-formed object of no known shape; logged and skipped.
    Ignored,
    /// The connection is dead.
    Lost,
    Frame(Frame),
}

fn try_read(stream: &mut TcpStream) -> ReadOutcome {
    let mut buf = [0u8; wire::MAX_FRAME_SIZE];

    match stream.read(&mut buf) {
        Ok(0) => ReadOutcome::Lost,
        Ok(count) => match wire::decode(&buf[..count]) {
            Ok(frame) => ReadOutcome::Frame(frame),
            Err(WireError::UnknownShape) => ReadOutcome::Ignored,
            // Malformed input is as terminal as a reset.
            Err(_) => ReadOutcome::Lost,
        },
        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            ReadOutcome::Idle
        }
        Err(_) => ReadOutcome::Lost,
    }
}

/// Background read loop. Each pass probes the socket briefly under the
/// lock, then dispatches with the lock released so a roster refresh can
/// issue its own requests.
fn receive_loop(core: Arc<Core>, events: mpsc::Sender<ClientEvent>) {
    logging::debug!(core.log, "receive loop started");

    while core.running.load(Ordering::Relaxed) {
        thread::sleep(RECEIVE_PAUSE);
        if !core.running.load(Ordering::Relaxed) {
            break;
        }

        let outcome = {
            let mut stream = core.stream.lock().expect(MUTEX_POISONED);
            drop(stream.set_read_timeout(Some(IDLE_READ_TIMEOUT)));
            let outcome = try_read(&mut stream);
            drop(stream.set_read_timeout(Some(REQUEST_TIMEOUT)));
            outcome
        };

        match outcome {
            ReadOutcome::Idle => {}
            ReadOutcome::Ignored => {
                logging::debug!(core.log, "unrecognised frame ignored");
            }
            ReadOutcome::Lost => {
                logging::error!(core.log, "{}", error::CONNECTION_LOST);
                core.running.store(false, Ordering::Relaxed);
                drop(events.send(ClientEvent::ConnectionLost));
            }
            ReadOutcome::Frame(frame) => dispatch(&core, &events, frame),
        }
    }

    logging::debug!(core.log, "receive loop finished");
}

fn dispatch(core: &Core, events: &mpsc::Sender<ClientEvent>, frame: Frame) {
    match frame {
        Frame::Reply(reply) => match reply.response {
            proto::OK => {}
            proto::ROSTER_CHANGED => {
                core.refresh_rosters();
                drop(events.send(ClientEvent::RosterChanged));
            }
            proto::BAD_REQUEST => {
                logging::error!(core.log, "server reported an error";
                                "error" => %reply.error.unwrap_or_default());
            }
            code => {
                logging::debug!(core.log, "unknown reply code ignored"; "code" => code);
            }
        },
        Frame::Request(Request::Message {
            time,
            from,
            to,
            message_text,
        }) if to == core.nickname => {
            logging::info!(core.log, "message received"; "from" => %from);
            must(
                core.store.append_history(&from, Direction::In, &message_text),
                "history append",
            );
            drop(events.send(ClientEvent::MessageReceived(InboundMessage {
                from,
                to,
                text: message_text,
                time,
            })));
        }
        other => {
            logging::debug!(core.log, "frame ignored"; "frame" => ?other);
        }
    }
}
