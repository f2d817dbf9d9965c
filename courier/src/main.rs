use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Arg, Command};
use courier::events::ClientEvent;
use courier::socket::Courier;
use courier::store::{ClientStore, Direction};
use flare::error;
use flare::keys::{self, KeyPair};
use flare::logging::{self, Logger};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::thread;

/// Number of history entries shown per conversation.
const HISTORY_WINDOW: usize = 20;

fn main() {
    let matches = Command::new("Courier")
        .version("1.0")
        .about("Connects to the messaging server.")
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .default_value("localhost")
                .help("Server address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(clap::value_parser!(u16))
                .default_value("7777")
                .help("Server port"),
        )
        .arg(
            Arg::new("nickname")
                .short('n')
                .long("nickname")
                .required(true)
                .help("Account name"),
        )
        .arg(
            Arg::new("password")
                .long("password")
                .required(true)
                .help("Account password"),
        )
        .get_matches();

    let log = logging::init();

    let address = matches.get_one::<String>("address").expect("has default");
    let port = *matches.get_one::<u16>("port").expect("has default");
    let nickname = matches.get_one::<String>("nickname").expect("required");
    let password = matches.get_one::<String>("password").expect("required");

    if port < 1024 {
        logging::error!(log, "port must be between 1024 and 65535"; "port" => port);
        process::exit(1);
    }

    let key_path = PathBuf::from(format!("{}.key", nickname));
    let keys = KeyPair::load_or_generate(&key_path, keys::DEFAULT_KEY_BITS).unwrap_or_else(|err| {
        logging::error!(log, "key pair unavailable"; "path" => %key_path.display(), "error" => %err);
        process::exit(1);
    });

    let store = ClientStore::open(nickname).unwrap_or_else(|err| {
        logging::error!(log, "client store open failed"; "error" => %err);
        process::exit(1);
    });

    let (mut courier, events) =
        Courier::connect(address, port, nickname, password, &keys, store, &log).unwrap_or_else(
            |err| {
                logging::error!(log, "{}", err);
                process::exit(1);
            },
        );

    let printer = thread::spawn({
        let keys = keys.clone();
        move || print_events(events, keys)
    });

    console(&courier, &log);

    courier.disconnect();
    drop(printer.join());
}

/// Prints receive-thread events; the stand-in for the GUI's signal slots.
/// Inbound bodies are decrypted here; undecryptable ones are reported and
/// discarded.
fn print_events(events: mpsc::Receiver<ClientEvent>, keys: KeyPair) {
    for event in events {
        match event {
            ClientEvent::MessageReceived(message) => {
                let decrypted = BASE64
                    .decode(&message.text)
                    .ok()
                    .and_then(|cipher| keys.decrypt(&cipher).ok())
                    .and_then(|plain| String::from_utf8(plain).ok());
                match decrypted {
                    Some(text) => println!("[{}] {}", message.from, text),
                    None => println!("Не удалось декодировать сообщение от {}.", message.from),
                }
            }
            ClientEvent::RosterChanged => println!("(roster updated)"),
            ClientEvent::ConnectionLost => {
                println!("{}", error::CONNECTION_LOST);
                break;
            }
        }
    }
}

fn console(courier: &Courier, log: &Logger) {
    println!(
        "Commands: contacts | users | add <login> | del <login> | \
         send <login> <text> | history <login> | exit"
    );

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let mut parts = line.split_whitespace();

        match parts.next() {
            Some("contacts") => match courier.store().get_contacts() {
                Ok(contacts) => contacts.iter().for_each(|contact| println!("{}", contact)),
                Err(err) => println!("store error: {}", err),
            },
            Some("users") => match courier.store().get_known_users() {
                Ok(users) => users.iter().for_each(|user| println!("{}", user)),
                Err(err) => println!("store error: {}", err),
            },
            Some("add") => match parts.next() {
                Some(contact) => {
                    match courier.add_contact(contact) {
                        Ok(()) => {
                            if let Err(err) = courier.store().add_contact(contact) {
                                println!("store error: {}", err);
                            }
                        }
                        Err(err) => println!("{}", err),
                    }
                }
                None => println!("usage: add <login>"),
            },
            Some("del") => match parts.next() {
                Some(contact) => {
                    match courier.remove_contact(contact) {
                        Ok(()) => {
                            if let Err(err) = courier.store().delete_contact(contact) {
                                println!("store error: {}", err);
                            }
                        }
                        Err(err) => println!("{}", err),
                    }
                }
                None => println!("usage: del <login>"),
            },
            Some("send") => {
                let Some(peer) = parts.next() else {
                    println!("usage: send <login> <text>");
                    continue;
                };
                let text = parts.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    continue;
                }
                send_encrypted(courier, log, peer, &text);
            }
            Some("history") => match parts.next() {
                Some(peer) => match courier.store().history_with(peer) {
                    Ok(entries) => {
                        let start = entries.len().saturating_sub(HISTORY_WINDOW);
                        for entry in &entries[start..] {
                            let arrow = match entry.direction {
                                Direction::In => "<-",
                                Direction::Out => "->",
                            };
                            println!("{} {} {}", entry.when, arrow, entry.body);
                        }
                    }
                    Err(err) => println!("store error: {}", err),
                },
                None => println!("usage: history <login>"),
            },
            Some("exit") => break,
            Some(other) => println!("unknown command: {}", other),
            None => {}
        }
    }
}

/// Fetches the peer's key, encrypts the text to it and ships the base64
/// ciphertext. The plaintext lands in local history only on success.
fn send_encrypted(courier: &Courier, log: &Logger, peer: &str, text: &str) {
    let Some(pem) = courier.fetch_public_key(peer) else {
        println!("no public key for {}", peer);
        return;
    };

    let cipher = match KeyPair::encrypt_for(&pem, text.as_bytes()) {
        Ok(cipher) => cipher,
        Err(err) => {
            logging::error!(log, "encryption failed"; "peer" => %peer, "error" => %err);
            println!("encryption failed: {}", err);
            return;
        }
    };

    match courier.send(peer, &BASE64.encode(cipher)) {
        Ok(()) => {
            if let Err(err) = courier.store().append_history(peer, Direction::Out, text) {
                println!("store error: {}", err);
            }
        }
        Err(err) => println!("{}", err),
    }
}
