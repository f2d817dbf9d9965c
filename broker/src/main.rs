use broker::config::{self, ServerConfig};
use broker::store::ServerStore;
use broker::Broker;
use clap::{Arg, Command};
use flare::crypto;
use flare::logging::{self, Logger};
use std::io::{self, BufRead};
use std::path::Path;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn main() {
    let matches = Command::new("Broker")
        .version("1.0")
        .about("Runs the messaging server.")
        .arg(
            Arg::new("addr")
                .short('a')
                .long("addr")
                .help("Listening address, empty for all interfaces"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(clap::value_parser!(u16))
                .help("Listening port"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .default_value("server_config.toml")
                .help("Path to the config file"),
        )
        .get_matches();

    let log = logging::init();

    let config_path = matches.get_one::<String>("config").expect("has default");
    let config = ServerConfig::load(Path::new(config_path)).unwrap_or_else(|err| {
        logging::error!(log, "config file rejected"; "path" => %config_path, "error" => %err);
        process::exit(1);
    });

    let address = matches
        .get_one::<String>("addr")
        .cloned()
        .unwrap_or_else(|| config.listen_address.clone());
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .unwrap_or(config.default_port);

    if !config::valid_port(port) {
        logging::error!(log, "port must be between 1024 and 65535"; "port" => port);
        process::exit(1);
    }

    let store = ServerStore::open(config.db_file_path(), &log).unwrap_or_else(|err| {
        logging::error!(log, "store open failed"; "error" => %err);
        process::exit(1);
    });

    let mut broker = Broker::start(&address, port, store, &log).unwrap_or_else(|err| {
        logging::error!(log, "server start failed"; "error" => %err);
        process::exit(1);
    });

    let interrupt = broker.shutdown_flag();
    ctrlc::set_handler(move || interrupt.store(false, Ordering::Relaxed))
        .expect("Signal handler installation failed");

    console(&broker, &log);
    broker.stop();

    logging::info!(log, "server stopped");
}

/// Operator console driving the control surface; the original deployment's
/// admin window, reduced to stdin commands.
fn console(broker: &Broker, log: &Logger) {
    let (lines_tx, lines) = mpsc::channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    println!(
        "Commands: reg <login> <password> | rm <login> | passwd <login> <password> | \
         active | users | history [login] | counters | exit"
    );

    let working = broker.shutdown_flag();
    while working.load(Ordering::Relaxed) {
        let line = match lines.recv_timeout(Duration::from_millis(250)) {
            Ok(line) => line,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("reg") => match (parts.next(), parts.next()) {
                (Some(login), Some(password)) => {
                    let hash = crypto::password_hash(password, login);
                    match broker.register_user(login, &hash) {
                        Ok(()) => {
                            println!("registered {}", login);
                            drop(broker.broadcast_roster_changed());
                        }
                        Err(err) => println!("registration failed: {}", err),
                    }
                }
                _ => println!("usage: reg <login> <password>"),
            },
            Some("rm") => match parts.next() {
                Some(login) => match broker.remove_user(login) {
                    Ok(()) => println!("removed {}", login),
                    Err(err) => println!("removal failed: {}", err),
                },
                None => println!("usage: rm <login>"),
            },
            Some("passwd") => match (parts.next(), parts.next()) {
                (Some(login), Some(password)) => {
                    let hash = crypto::password_hash(password, login);
                    match broker.change_password(login, &hash) {
                        Ok(()) => println!("password changed for {}", login),
                        Err(err) => println!("password change failed: {}", err),
                    }
                }
                _ => println!("usage: passwd <login> <password>"),
            },
            Some("active") => match broker.list_active_users() {
                Ok(sessions) => {
                    for session in sessions {
                        println!(
                            "{}  {}:{}  since {}",
                            session.login, session.ip, session.port, session.since
                        );
                    }
                }
                Err(err) => println!("listing failed: {}", err),
            },
            Some("users") => match broker.list_all_users() {
                Ok(users) => {
                    for user in users {
                        println!("{}  last login {}", user.login, user.last_login);
                    }
                }
                Err(err) => println!("listing failed: {}", err),
            },
            Some("history") => match broker.login_history(parts.next()) {
                Ok(records) => {
                    for record in records {
                        println!(
                            "{}  {}:{}  at {}",
                            record.login, record.ip, record.port, record.when
                        );
                    }
                }
                Err(err) => println!("listing failed: {}", err),
            },
            Some("counters") => match broker.message_counters() {
                Ok(rows) => {
                    for row in rows {
                        println!(
                            "{}  sent {}  received {}  last login {}",
                            row.login, row.sent, row.received, row.last_login
                        );
                    }
                }
                Err(err) => println!("listing failed: {}", err),
            },
            Some("exit") => break,
            Some(other) => {
                logging::debug!(log, "unknown console command"; "command" => %other);
                println!("unknown command: {}", other);
            }
            None => {}
        }
    }
}
