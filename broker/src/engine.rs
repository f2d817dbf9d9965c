use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flare::crypto;
use flare::logging::{self, Logger};
use flare::proto::{self, Frame, Reply, Request};
use std::mem;
use std::net::SocketAddr;

use crate::session::{ConnId, SessionTable};
use crate::store::ServerStore;

/// Authentication progress of a single connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnState {
    /// Nothing accepted yet except a presence.
    Unauth,
    /// Challenge issued, awaiting the HMAC answer.
    ChallengeSent {
        login: String,
        pubkey: String,
        challenge: String,
    },
    /// Bound to a login; the full dispatch table applies.
    Authenticated { login: String },
}

/// Side effects the loop applies after a frame has been handled. Replies
/// are written before closes, so a refusal still reaches the peer.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Write a frame to a connection; a failed write evicts it.
    Reply(ConnId, Frame),
    /// Copy the sender's raw frame bytes to another connection; a failed
    /// write evicts the recipient, never the sender.
    Forward(ConnId, Vec<u8>),
    /// Evict a connection.
    Close(ConnId),
    /// Write a frame to every authenticated connection.
    Broadcast(Frame),
}

/// Validates inbound frames against the per-connection state machine,
/// mutates the store and session table, and emits the actions the loop
/// must apply. Single-owner: only the server loop thread calls in.
pub struct Engine {
    store: ServerStore,
    sessions: SessionTable,
    log: Logger,
}

fn must<T>(result: rusqlite::Result<T>, context: &str) -> T {
    result.unwrap_or_else(|err| panic!("Fatal store failure during {}: {}", context, err))
}

impl Engine {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(store: ServerStore, log: L) -> Engine {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        Engine {
            store,
            sessions: SessionTable::new(),
            log,
        }
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ServerStore {
        &mut self.store
    }

    /// The live connection bound to `login`, if any.
    pub fn session_of(&self, login: &str) -> Option<ConnId> {
        self.sessions.lookup(login)
    }

    /// Handles one decoded frame. `raw` is the frame exactly as it came off
    /// the wire, reused for verbatim forwarding.
    pub fn handle_frame(
        &mut self,
        id: ConnId,
        peer: SocketAddr,
        state: &mut ConnState,
        frame: Frame,
        raw: &[u8],
    ) -> Vec<Action> {
        match state {
            ConnState::Unauth => self.handle_presence(id, state, frame),
            ConnState::ChallengeSent { .. } => self.handle_answer(id, peer, state, frame),
            ConnState::Authenticated { .. } => self.handle_request(id, state, frame, raw),
        }
    }

    /// The loop is about to drop a connection; release everything bound to
    /// it.
    pub fn connection_closed(&mut self, state: &ConnState) {
        if let ConnState::Authenticated { login } = state {
            self.sessions.unbind(login);
            must(self.store.logout_user(login), "logout");
            logging::info!(self.log, "session ended"; "login" => %login);
        }
    }

    fn handle_presence(&mut self, id: ConnId, state: &mut ConnState, frame: Frame) -> Vec<Action> {
        let user = match frame {
            Frame::Request(Request::Presence { user, .. }) => user,
            other => {
                logging::debug!(self.log, "frame before authentication refused";
                                "conn" => id, "frame" => ?other);
                return vec![
                    Action::Reply(id, Frame::Reply(Reply::error(proto::ERR_BAD_REQUEST))),
                    Action::Close(id),
                ];
            }
        };

        logging::debug!(self.log, "authorization started"; "conn" => id, "login" => %user.account_name);

        if self.sessions.contains(&user.account_name) {
            logging::info!(self.log, "presence refused, name taken"; "login" => %user.account_name);
            return vec![
                Action::Reply(id, Frame::Reply(Reply::error(proto::ERR_NAME_TAKEN))),
                Action::Close(id),
            ];
        }

        if !must(self.store.user_exists(&user.account_name), "user lookup") {
            logging::info!(self.log, "presence refused, unknown user"; "login" => %user.account_name);
            // The connection stays open; the peer may retry with another
            // account name.
            return vec![Action::Reply(
                id,
                Frame::Reply(Reply::error(proto::ERR_NOT_REGISTERED)),
            )];
        }

        let challenge = crypto::challenge();
        *state = ConnState::ChallengeSent {
            login: user.account_name,
            pubkey: user.pubkey,
            challenge: challenge.clone(),
        };

        vec![Action::Reply(id, Frame::Reply(Reply::auth(challenge)))]
    }

    fn handle_answer(
        &mut self,
        id: ConnId,
        peer: SocketAddr,
        state: &mut ConnState,
        frame: Frame,
    ) -> Vec<Action> {
        let ConnState::ChallengeSent {
            login,
            pubkey,
            challenge,
        } = mem::replace(state, ConnState::Unauth)
        else {
            unreachable!("handle_answer outside CHALLENGE_SENT");
        };

        let answer = match &frame {
            Frame::Reply(reply) if reply.response == proto::AUTH_PAYLOAD => reply
                .bin
                .as_deref()
                .and_then(|bin| BASE64.decode(bin).ok()),
            _ => None,
        };

        let verified = match (&answer, must(self.store.password_hash_of(&login), "hash lookup")) {
            (Some(answer), Some(hash)) => crypto::verify_answer(&hash, &challenge, answer),
            _ => false,
        };

        if !verified {
            logging::info!(self.log, "authorization failed"; "conn" => id, "login" => %login);
            return vec![
                Action::Reply(id, Frame::Reply(Reply::error(proto::ERR_BAD_PASSWORD))),
                Action::Close(id),
            ];
        }

        self.sessions.bind(&login, id);
        must(
            self.store
                .login_user(&login, &peer.ip().to_string(), peer.port(), &pubkey),
            "login",
        );
        logging::info!(self.log, "session established";
                       "conn" => id, "login" => %login, "peer" => %peer);

        *state = ConnState::Authenticated { login };

        vec![Action::Reply(id, Frame::Reply(Reply::ok()))]
    }

    fn handle_request(
        &mut self,
        id: ConnId,
        state: &mut ConnState,
        frame: Frame,
        raw: &[u8],
    ) -> Vec<Action> {
        let login = match state {
            ConnState::Authenticated { login } => login.clone(),
            _ => unreachable!("handle_request outside AUTHENTICATED"),
        };

        let request = match frame {
            Frame::Request(request) => request,
            Frame::Reply(reply) => {
                logging::debug!(self.log, "unexpected reply frame"; "conn" => id, "reply" => ?reply);
                return self.bad_request(id);
            }
        };

        match request {
            Request::Message { from, to, .. } => {
                // An authenticated peer must not forge the sender field.
                if from != login {
                    return self.bad_request(id);
                }
                match self.sessions.lookup(&to) {
                    Some(dest) => {
                        must(self.store.bump_counters(&from, &to), "counter update");
                        logging::info!(self.log, "message routed"; "from" => %from, "to" => %to);
                        vec![
                            Action::Forward(dest, raw.to_vec()),
                            Action::Reply(id, Frame::Reply(Reply::ok())),
                        ]
                    }
                    None => {
                        logging::info!(self.log, "recipient has no session"; "to" => %to);
                        vec![Action::Reply(
                            id,
                            Frame::Reply(Reply::error(proto::ERR_USER_NOT_REGISTERED)),
                        )]
                    }
                }
            }
            Request::GetContacts { user, .. } => {
                if user != login {
                    return self.bad_request(id);
                }
                let contacts = must(self.store.contacts_of(&user), "contact listing");
                vec![Action::Reply(id, Frame::Reply(Reply::list(contacts)))]
            }
            Request::GetUsers { account_name, .. } => {
                if account_name != login {
                    return self.bad_request(id);
                }
                let logins = must(self.store.all_users(), "user listing")
                    .into_iter()
                    .map(|user| user.login)
                    .collect();
                vec![Action::Reply(id, Frame::Reply(Reply::list(logins)))]
            }
            Request::Add {
                user, account_name, ..
            } => {
                if user != login {
                    return self.bad_request(id);
                }
                must(self.store.add_contact(&user, &account_name), "contact insert");
                vec![Action::Reply(id, Frame::Reply(Reply::ok()))]
            }
            Request::Remove {
                user, account_name, ..
            } => {
                if user != login {
                    return self.bad_request(id);
                }
                must(self.store.remove_contact(&user, &account_name), "contact delete");
                vec![Action::Reply(id, Frame::Reply(Reply::ok()))]
            }
            Request::PubkeyNeed { account_name, .. } => {
                match must(self.store.public_key_of(&account_name), "key lookup") {
                    Some(pem) => vec![Action::Reply(id, Frame::Reply(Reply::auth(pem)))],
                    None => vec![Action::Reply(
                        id,
                        Frame::Reply(Reply::error(proto::ERR_NO_PUBLIC_KEY)),
                    )],
                }
            }
            Request::Exit { account_name, .. } => {
                if account_name != login {
                    return self.bad_request(id);
                }
                logging::info!(self.log, "client leaving"; "login" => %login);
                vec![Action::Close(id)]
            }
            Request::Presence { .. } => self.bad_request(id),
        }
    }

    fn bad_request(&self, id: ConnId) -> Vec<Action> {
        vec![Action::Reply(
            id,
            Frame::Reply(Reply::error(proto::ERR_BAD_REQUEST)),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare::wire;

    const PEM: &str = "-----BEGIN PUBLIC KEY-----\ntest\n-----END PUBLIC KEY-----\n";

    fn engine() -> Engine {
        let store = ServerStore::open_in_memory(None).unwrap();
        store
            .register_user("alice", &crypto::password_hash("pw", "alice"))
            .unwrap();
        store
            .register_user("bob", &crypto::password_hash("pw", "bob"))
            .unwrap();
        Engine::new(store, None)
    }

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn feed(engine: &mut Engine, id: ConnId, state: &mut ConnState, frame: Frame) -> Vec<Action> {
        let raw = wire::encode(&frame).unwrap();
        engine.handle_frame(id, peer(50_000 + id as u16), state, frame, &raw)
    }

    /// Runs the full presence/challenge/answer exchange for a connection.
    fn authenticate(engine: &mut Engine, id: ConnId, login: &str, password: &str) -> ConnState {
        let mut state = ConnState::Unauth;

        let actions = feed(
            engine,
            id,
            &mut state,
            Frame::Request(Request::presence(login, PEM)),
        );
        let challenge = match &actions[..] {
            [Action::Reply(_, Frame::Reply(reply))] if reply.response == proto::AUTH_PAYLOAD => {
                reply.bin.clone().unwrap()
            }
            other => panic!("Unexpected presence outcome {:?}", other),
        };

        let hash = crypto::password_hash(password, login);
        let answer = BASE64.encode(crypto::challenge_answer(&hash, &challenge));
        let actions = feed(engine, id, &mut state, Frame::Reply(Reply::auth(answer)));

        assert_eq!(
            actions,
            vec![Action::Reply(id, Frame::Reply(Reply::ok()))],
            "authentication should succeed"
        );

        state
    }

    #[test]
    fn test_presence_unknown_user_keeps_connection() {
        let mut engine = engine();
        let mut state = ConnState::Unauth;

        let actions = feed(
            &mut engine,
            0,
            &mut state,
            Frame::Request(Request::presence("carol", PEM)),
        );

        assert_eq!(
            actions,
            vec![Action::Reply(
                0,
                Frame::Reply(Reply::error(proto::ERR_NOT_REGISTERED))
            )]
        );
        assert_eq!(state, ConnState::Unauth);
    }

    #[test]
    fn test_presence_retry_after_unknown_user() {
        let mut engine = engine();
        let mut state = ConnState::Unauth;

        feed(
            &mut engine,
            0,
            &mut state,
            Frame::Request(Request::presence("carol", PEM)),
        );
        let actions = feed(
            &mut engine,
            0,
            &mut state,
            Frame::Request(Request::presence("alice", PEM)),
        );

        assert!(matches!(
            actions[..],
            [Action::Reply(0, Frame::Reply(Reply { response: 511, .. }))]
        ));
        assert!(matches!(state, ConnState::ChallengeSent { .. }));
    }

    #[test]
    fn test_non_presence_before_auth_drops_connection() {
        let mut engine = engine();
        let mut state = ConnState::Unauth;

        let actions = feed(
            &mut engine,
            0,
            &mut state,
            Frame::Request(Request::get_users("alice")),
        );

        assert_eq!(
            actions,
            vec![
                Action::Reply(0, Frame::Reply(Reply::error(proto::ERR_BAD_REQUEST))),
                Action::Close(0),
            ]
        );
    }

    #[test]
    fn test_successful_authentication() {
        let mut engine = engine();

        let state = authenticate(&mut engine, 0, "alice", "pw");

        assert_eq!(
            state,
            ConnState::Authenticated {
                login: "alice".to_owned()
            }
        );
        assert_eq!(engine.session_of("alice"), Some(0));
        assert_eq!(engine.store().active_users().unwrap().len(), 1);
        assert_eq!(engine.store().login_history(Some("alice")).unwrap().len(), 1);
        assert_eq!(engine.store().public_key_of("alice").unwrap().unwrap(), PEM);
    }

    #[test]
    fn test_wrong_password_closes_connection() {
        let mut engine = engine();
        let mut state = ConnState::Unauth;

        feed(
            &mut engine,
            0,
            &mut state,
            Frame::Request(Request::presence("alice", PEM)),
        );
        let wrong = BASE64.encode([0u8; crypto::ANSWER_SIZE]);
        let actions = feed(&mut engine, 0, &mut state, Frame::Reply(Reply::auth(wrong)));

        assert_eq!(
            actions,
            vec![
                Action::Reply(0, Frame::Reply(Reply::error(proto::ERR_BAD_PASSWORD))),
                Action::Close(0),
            ]
        );
        assert_eq!(engine.session_of("alice"), None);
        assert!(engine.store().active_users().unwrap().is_empty());
    }

    #[test]
    fn test_name_taken_refused() {
        let mut engine = engine();
        authenticate(&mut engine, 0, "alice", "pw");

        let mut state = ConnState::Unauth;
        let actions = feed(
            &mut engine,
            1,
            &mut state,
            Frame::Request(Request::presence("alice", PEM)),
        );

        assert_eq!(
            actions,
            vec![
                Action::Reply(1, Frame::Reply(Reply::error(proto::ERR_NAME_TAKEN))),
                Action::Close(1),
            ]
        );
        // The original session is untouched.
        assert_eq!(engine.session_of("alice"), Some(0));
    }

    #[test]
    fn test_message_routed_verbatim() {
        let mut engine = engine();
        let mut alice = authenticate(&mut engine, 0, "alice", "pw");
        authenticate(&mut engine, 1, "bob", "pw");

        let frame = Frame::Request(Request::message("alice", "bob", "AAAA"));
        let raw = wire::encode(&frame).unwrap();
        let actions = engine.handle_frame(0, peer(50_000), &mut alice, frame, &raw);

        assert_eq!(
            actions,
            vec![
                Action::Forward(1, raw),
                Action::Reply(0, Frame::Reply(Reply::ok())),
            ]
        );

        let counters = engine.store().message_counters().unwrap();
        let alice_row = counters.iter().find(|row| row.login == "alice").unwrap();
        let bob_row = counters.iter().find(|row| row.login == "bob").unwrap();
        assert_eq!((alice_row.sent, alice_row.received), (1, 0));
        assert_eq!((bob_row.sent, bob_row.received), (0, 1));
    }

    #[test]
    fn test_message_to_offline_user_rejected() {
        let mut engine = engine();
        let mut alice = authenticate(&mut engine, 0, "alice", "pw");

        let actions = feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::message("alice", "bob", "AAAA")),
        );

        assert_eq!(
            actions,
            vec![Action::Reply(
                0,
                Frame::Reply(Reply::error(proto::ERR_USER_NOT_REGISTERED))
            )]
        );
        let counters = engine.store().message_counters().unwrap();
        assert!(counters.iter().all(|row| row.sent == 0 && row.received == 0));
    }

    #[test]
    fn test_forged_sender_rejected() {
        let mut engine = engine();
        let mut alice = authenticate(&mut engine, 0, "alice", "pw");
        authenticate(&mut engine, 1, "bob", "pw");

        let actions = feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::message("bob", "bob", "AAAA")),
        );

        assert_eq!(
            actions,
            vec![Action::Reply(
                0,
                Frame::Reply(Reply::error(proto::ERR_BAD_REQUEST))
            )]
        );
    }

    #[test]
    fn test_contact_listing_after_add() {
        let mut engine = engine();
        let mut alice = authenticate(&mut engine, 0, "alice", "pw");

        feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::add("alice", "bob")),
        );
        feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::add("alice", "bob")),
        );
        let actions = feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::get_contacts("alice")),
        );

        assert_eq!(
            actions,
            vec![Action::Reply(
                0,
                Frame::Reply(Reply::list(vec!["bob".to_owned()]))
            )]
        );
    }

    #[test]
    fn test_identity_checked_on_queries() {
        let mut engine = engine();
        let mut alice = authenticate(&mut engine, 0, "alice", "pw");

        for frame in [
            Frame::Request(Request::get_contacts("bob")),
            Frame::Request(Request::get_users("bob")),
            Frame::Request(Request::add("bob", "alice")),
            Frame::Request(Request::remove("bob", "alice")),
            Frame::Request(Request::exit("bob")),
        ] {
            let actions = feed(&mut engine, 0, &mut alice, frame);
            assert_eq!(
                actions,
                vec![Action::Reply(
                    0,
                    Frame::Reply(Reply::error(proto::ERR_BAD_REQUEST))
                )]
            );
        }
    }

    #[test]
    fn test_pubkey_request() {
        let mut engine = engine();
        let mut alice = authenticate(&mut engine, 0, "alice", "pw");
        authenticate(&mut engine, 1, "bob", "pw");

        let actions = feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::pubkey_need("bob")),
        );
        assert_eq!(
            actions,
            vec![Action::Reply(0, Frame::Reply(Reply::auth(PEM)))]
        );

        // Registered but never logged in: no key stored yet.
        engine
            .store()
            .register_user("carol", &crypto::password_hash("pw", "carol"))
            .unwrap();
        let actions = feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::pubkey_need("carol")),
        );
        assert_eq!(
            actions,
            vec![Action::Reply(
                0,
                Frame::Reply(Reply::error(proto::ERR_NO_PUBLIC_KEY))
            )]
        );
    }

    #[test]
    fn test_exit_closes_connection() {
        let mut engine = engine();
        let mut alice = authenticate(&mut engine, 0, "alice", "pw");

        let actions = feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::exit("alice")),
        );

        assert_eq!(actions, vec![Action::Close(0)]);
    }

    #[test]
    fn test_connection_closed_releases_session() {
        let mut engine = engine();
        let alice = authenticate(&mut engine, 0, "alice", "pw");

        engine.connection_closed(&alice);

        assert_eq!(engine.session_of("alice"), None);
        assert!(engine.store().active_users().unwrap().is_empty());
    }

    #[test]
    fn test_presence_while_authenticated_is_bad_request() {
        let mut engine = engine();
        let mut alice = authenticate(&mut engine, 0, "alice", "pw");

        let actions = feed(
            &mut engine,
            0,
            &mut alice,
            Frame::Request(Request::presence("alice", PEM)),
        );

        assert_eq!(
            actions,
            vec![Action::Reply(
                0,
                Frame::Reply(Reply::error(proto::ERR_BAD_REQUEST))
            )]
        );
        assert!(matches!(alice, ConnState::Authenticated { .. }));
    }
}
