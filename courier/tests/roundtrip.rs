//! Full client-server-client round trips: two live couriers against a live
//! broker, with real RSA-encrypted bodies.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use broker::store::ServerStore;
use broker::Broker;
use courier::events::ClientEvent;
use courier::socket::Courier;
use courier::store::{ClientStore, Direction};
use flare::crypto;
use flare::keys::KeyPair;
use std::sync::mpsc;
use std::time::Duration;

// Short keys keep the tests fast; the wire does not care about key size.
const TEST_KEY_BITS: usize = 512;
/// Generous bound: the receive loop only wakes once a second.
const EVENT_WAIT: Duration = Duration::from_secs(10);

fn start_broker(users: &[&str]) -> Broker {
    let store = ServerStore::open_in_memory(None).unwrap();
    let broker = Broker::start("127.0.0.1", 0, store, None).unwrap();

    for login in users {
        broker
            .register_user(login, &crypto::password_hash("pw", login))
            .unwrap();
    }

    broker
}

fn connect(
    broker: &Broker,
    login: &str,
    keys: &KeyPair,
) -> (Courier, mpsc::Receiver<ClientEvent>) {
    Courier::connect(
        &broker.address().ip().to_string(),
        broker.address().port(),
        login,
        "pw",
        keys,
        ClientStore::open_in_memory().unwrap(),
        None,
    )
    .unwrap()
}

#[test]
fn encrypted_message_round_trip() {
    let broker = start_broker(&["alice", "bob"]);
    let alice_keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let bob_keys = KeyPair::generate(TEST_KEY_BITS).unwrap();

    let (mut alice, _alice_events) = connect(&broker, "alice", &alice_keys);
    let (mut bob, bob_events) = connect(&broker, "bob", &bob_keys);

    // Connecting primed the local mirror of the server roster.
    assert!(alice.store().has_user("bob").unwrap());
    assert!(bob.store().has_user("alice").unwrap());

    alice.add_contact("bob").unwrap();
    alice.request_contacts().unwrap();
    assert!(alice.store().has_contact("bob").unwrap());

    let bob_pem = alice.fetch_public_key("bob").expect("bob has a stored key");
    let cipher = KeyPair::encrypt_for(&bob_pem, b"hello bob").unwrap();
    let body = BASE64.encode(cipher);

    alice.send("bob", &body).unwrap();
    alice
        .store()
        .append_history("bob", Direction::Out, "hello bob")
        .unwrap();

    let message = match bob_events.recv_timeout(EVENT_WAIT).unwrap() {
        ClientEvent::MessageReceived(message) => message,
        other => panic!("Unexpected event {:?}", other),
    };

    assert_eq!(message.from, "alice");
    assert_eq!(message.to, "bob");
    // The ciphertext crossed the server untouched and only bob can open it.
    assert_eq!(message.text, body);
    let plain = bob_keys.decrypt(&BASE64.decode(&message.text).unwrap()).unwrap();
    assert_eq!(plain, b"hello bob");

    let history = bob.store().history_with("alice").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].direction, Direction::In);
    assert_eq!(history[0].body, body);

    let counters = broker.message_counters().unwrap();
    let alice_row = counters.iter().find(|row| row.login == "alice").unwrap();
    let bob_row = counters.iter().find(|row| row.login == "bob").unwrap();
    assert_eq!((alice_row.sent, alice_row.received), (1, 0));
    assert_eq!((bob_row.sent, bob_row.received), (0, 1));

    alice.disconnect();
    bob.disconnect();
}

#[test]
fn send_to_offline_peer_surfaces_error() {
    let broker = start_broker(&["alice", "carol"]);
    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let (mut alice, _events) = connect(&broker, "alice", &keys);

    let err = alice.send("carol", "b64-body").unwrap_err();

    assert!(err.0.contains("user not registered"), "got: {}", err.0);

    alice.disconnect();
}

#[test]
fn wrong_password_surfaces_server_message() {
    let broker = start_broker(&["alice"]);
    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();

    let err = Courier::connect(
        &broker.address().ip().to_string(),
        broker.address().port(),
        "alice",
        "wrong",
        &keys,
        ClientStore::open_in_memory().unwrap(),
        None,
    )
    .unwrap_err();

    assert_eq!(err.0, "bad password");
}

#[test]
fn unknown_account_is_refused() {
    let broker = start_broker(&["alice"]);
    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();

    let err = Courier::connect(
        &broker.address().ip().to_string(),
        broker.address().port(),
        "mallory",
        "pw",
        &keys,
        ClientStore::open_in_memory().unwrap(),
        None,
    )
    .unwrap_err();

    assert_eq!(err.0, "not registered");
}

#[test]
fn roster_refreshes_after_operator_removal() {
    let broker = start_broker(&["alice", "mallory"]);
    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let (mut alice, events) = connect(&broker, "alice", &keys);

    assert!(alice.store().has_user("mallory").unwrap());

    broker.remove_user("mallory").unwrap();

    match events.recv_timeout(EVENT_WAIT).unwrap() {
        ClientEvent::RosterChanged => {}
        other => panic!("Unexpected event {:?}", other),
    }
    assert!(!alice.store().has_user("mallory").unwrap());

    alice.disconnect();
}

#[test]
fn eviction_signals_connection_lost() {
    let broker = start_broker(&["alice", "bob"]);
    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let (_bob, events) = connect(&broker, "bob", &keys);

    broker.remove_user("bob").unwrap();

    match events.recv_timeout(EVENT_WAIT).unwrap() {
        ClientEvent::ConnectionLost => {}
        other => panic!("Unexpected event {:?}", other),
    }
}

#[test]
fn contact_listing_mirrors_server() {
    let broker = start_broker(&["alice", "bob", "carol"]);
    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let (mut alice, _events) = connect(&broker, "alice", &keys);

    alice.add_contact("bob").unwrap();
    alice.add_contact("carol").unwrap();
    alice.remove_contact("carol").unwrap();
    alice.request_contacts().unwrap();

    assert_eq!(alice.store().get_contacts().unwrap(), vec!["bob".to_owned()]);

    alice.disconnect();
}

#[test]
fn known_users_match_server_roster() {
    let broker = start_broker(&["alice", "bob", "carol"]);
    let keys = KeyPair::generate(TEST_KEY_BITS).unwrap();
    let (mut alice, _events) = connect(&broker, "alice", &keys);

    let local = alice.store().get_known_users().unwrap();
    let server: Vec<String> = broker
        .list_all_users()
        .unwrap()
        .into_iter()
        .map(|user| user.login)
        .collect();

    assert_eq!(local, server);

    alice.disconnect();
}
