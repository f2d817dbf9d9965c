//! The message broker: a single-threaded readiness loop that authenticates
//! clients over a challenge/response exchange and routes opaque message
//! bodies between them, backed by an embedded SQL store.
//!
//! The loop thread owns every piece of mutable state (store, session table,
//! connections). Operators drive it through the [`Broker`] handle, whose
//! operations travel to the loop as [`Command`] values and are serviced
//! between polls, so no locking exists anywhere in the server.

use flare::logging::{self, Logger};
use mio::net::TcpListener;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use thiserror::Error;

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod session;
pub mod store;

use endpoint::Endpoint;
use engine::Engine;
use store::{ActiveSession, CounterRow, LoginRecord, ServerStore, UserSummary};

/// Failures surfaced through the control handle.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("server store failure: {0}")]
    Store(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("server loop is not running")]
    Stopped,
}

/// Operator requests serviced by the loop thread between polls.
pub enum Command {
    RegisterUser {
        login: String,
        password_hash: String,
        reply: mpsc::Sender<Result<(), BrokerError>>,
    },
    RemoveUser {
        login: String,
        reply: mpsc::Sender<Result<(), BrokerError>>,
    },
    ChangePassword {
        login: String,
        password_hash: String,
        reply: mpsc::Sender<Result<(), BrokerError>>,
    },
    BroadcastRosterChanged,
    ListActiveUsers {
        reply: mpsc::Sender<Result<Vec<ActiveSession>, BrokerError>>,
    },
    ListAllUsers {
        reply: mpsc::Sender<Result<Vec<UserSummary>, BrokerError>>,
    },
    LoginHistory {
        login: Option<String>,
        reply: mpsc::Sender<Result<Vec<LoginRecord>, BrokerError>>,
    },
    MessageCounters {
        reply: mpsc::Sender<Result<Vec<CounterRow>, BrokerError>>,
    },
}

/// Control handle over a running server loop.
pub struct Broker {
    commands: mpsc::Sender<Command>,
    working: Arc<AtomicBool>,
    address: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl Broker {
    /// Binds the listening socket and spawns the server loop. An empty
    /// address accepts connections from any interface; port 0 picks an
    /// ephemeral port, exposed through [`Broker::address`].
    pub fn start<'a, L>(
        address: &str,
        port: u16,
        store: ServerStore,
        log: L,
    ) -> Result<Broker, BrokerError>
    where
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let bind_to = if address.is_empty() { "0.0.0.0" } else { address };
        let resolved = (bind_to, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve"))?;

        let listener = TcpListener::bind(resolved)?;
        let local = listener.local_addr()?;

        let engine = Engine::new(store, &log);
        let endpoint = Endpoint::new(listener, engine, &log)?;

        let working = Arc::new(AtomicBool::new(true));
        let (commands, inbox) = mpsc::channel();

        let flag = working.clone();
        let worker = thread::Builder::new()
            .name("broker-loop".to_owned())
            .spawn(move || serve(endpoint, flag, inbox))
            .expect("Server thread spawn failed");

        logging::info!(log, "server listening"; "address" => %local);

        Ok(Broker {
            commands,
            working,
            address: local,
            worker: Some(worker),
        })
    }

    /// The bound listening address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Cooperative shutdown flag; flipping it stops the loop within one
    /// poll deadline. Shared with signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.working.clone()
    }

    /// Stops the loop and joins the server thread.
    pub fn stop(&mut self) {
        self.working.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            drop(worker.join());
        }
    }

    pub fn register_user(&self, login: &str, password_hash: &str) -> Result<(), BrokerError> {
        self.call(|reply| Command::RegisterUser {
            login: login.to_owned(),
            password_hash: password_hash.to_owned(),
            reply,
        })
    }

    /// Removes the user everywhere, evicts its live session and tells every
    /// remaining client to refresh its roster.
    pub fn remove_user(&self, login: &str) -> Result<(), BrokerError> {
        self.call(|reply| Command::RemoveUser {
            login: login.to_owned(),
            reply,
        })
    }

    /// Replaces the user's credentials, evicting its live session so the
    /// next login re-authenticates against the new hash.
    pub fn change_password(&self, login: &str, password_hash: &str) -> Result<(), BrokerError> {
        self.call(|reply| Command::ChangePassword {
            login: login.to_owned(),
            password_hash: password_hash.to_owned(),
            reply,
        })
    }

    pub fn broadcast_roster_changed(&self) -> Result<(), BrokerError> {
        self.commands
            .send(Command::BroadcastRosterChanged)
            .map_err(|_| BrokerError::Stopped)
    }

    pub fn list_active_users(&self) -> Result<Vec<ActiveSession>, BrokerError> {
        self.call(|reply| Command::ListActiveUsers { reply })
    }

    pub fn list_all_users(&self) -> Result<Vec<UserSummary>, BrokerError> {
        self.call(|reply| Command::ListAllUsers { reply })
    }

    pub fn login_history(&self, login: Option<&str>) -> Result<Vec<LoginRecord>, BrokerError> {
        self.call(|reply| Command::LoginHistory {
            login: login.map(str::to_owned),
            reply,
        })
    }

    pub fn message_counters(&self) -> Result<Vec<CounterRow>, BrokerError> {
        self.call(|reply| Command::MessageCounters { reply })
    }

    fn call<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<Result<T, BrokerError>>) -> Command,
    ) -> Result<T, BrokerError> {
        let (reply, answer) = mpsc::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| BrokerError::Stopped)?;
        answer.recv().map_err(|_| BrokerError::Stopped)?
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(mut endpoint: Endpoint, working: Arc<AtomicBool>, inbox: mpsc::Receiver<Command>) {
    while working.load(Ordering::Relaxed) {
        endpoint.pump();

        loop {
            match inbox.try_recv() {
                Ok(command) => endpoint.execute(command),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    working.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }
    // Dropping the endpoint closes the listener and every live connection.
}
