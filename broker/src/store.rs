use chrono::{DateTime, Utc};
use flare::logging::{self, Logger};
use flare::time;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS all_users (
    id            INTEGER PRIMARY KEY,
    login         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    public_key    TEXT,
    last_login    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS active_users (
    id          INTEGER PRIMARY KEY,
    user        TEXT NOT NULL UNIQUE REFERENCES all_users (login),
    ip_address  TEXT NOT NULL,
    port        INTEGER NOT NULL,
    last_active TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS user_login_history (
    id          INTEGER PRIMARY KEY,
    user        TEXT NOT NULL REFERENCES all_users (login),
    ip_address  TEXT NOT NULL,
    port        INTEGER NOT NULL,
    last_active TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS user_contacts (
    id            INTEGER PRIMARY KEY,
    contact_owner TEXT NOT NULL REFERENCES all_users (login),
    contact       TEXT NOT NULL,
    UNIQUE (contact_owner, contact)
);
CREATE TABLE IF NOT EXISTS user_action_history (
    id                INTEGER PRIMARY KEY,
    user              TEXT NOT NULL UNIQUE REFERENCES all_users (login),
    sent_messages     INTEGER NOT NULL DEFAULT 0,
    received_messages INTEGER NOT NULL DEFAULT 0
);
";

/// One row of the active-session listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub login: String,
    pub ip: String,
    pub port: u16,
    pub since: DateTime<Utc>,
}

/// Login plus the time of its most recent successful authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSummary {
    pub login: String,
    pub last_login: DateTime<Utc>,
}

/// One append-only record of a successful login.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginRecord {
    pub login: String,
    pub ip: String,
    pub port: u16,
    pub when: DateTime<Utc>,
}

/// Per-user message counters joined with the user's last login.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterRow {
    pub login: String,
    pub last_login: DateTime<Utc>,
    pub sent: u64,
    pub received: u64,
}

/// The server's persistent relational state: registry, credentials, public
/// keys, contacts, sessions, counters and login history. Owned by the
/// protocol engine and touched only on the server loop thread.
pub struct ServerStore {
    conn: Connection,
    log: Logger,
}

impl ServerStore {
    pub fn open<'a, L, P>(path: P, log: L) -> rusqlite::Result<ServerStore>
    where
        L: Into<Option<&'a Logger>>,
        P: AsRef<Path>,
    {
        ServerStore::from_conn(Connection::open(path)?, log)
    }

    pub fn open_in_memory<'a, L>(log: L) -> rusqlite::Result<ServerStore>
    where
        L: Into<Option<&'a Logger>>,
    {
        ServerStore::from_conn(Connection::open_in_memory()?, log)
    }

    fn from_conn<'a, L>(conn: Connection, log: L) -> rusqlite::Result<ServerStore>
    where
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        conn.execute_batch(SCHEMA)?;
        // Sessions never survive a restart.
        conn.execute("DELETE FROM active_users", [])?;

        Ok(ServerStore { conn, log })
    }

    /// Creates a user plus its counter row. Fails on a duplicate login.
    pub fn register_user(&self, login: &str, password_hash: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO all_users (login, password_hash, last_login) VALUES (?1, ?2, ?3)",
            params![login, password_hash, time::now()],
        )?;
        self.conn.execute(
            "INSERT INTO user_action_history (user) VALUES (?1)",
            params![login],
        )?;

        logging::debug!(self.log, "user registered"; "login" => %login);

        Ok(())
    }

    /// Removes the user and every row referencing it, in all tables.
    pub fn remove_user(&mut self, login: &str) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM active_users WHERE user = ?1", params![login])?;
        tx.execute("DELETE FROM user_login_history WHERE user = ?1", params![login])?;
        tx.execute("DELETE FROM user_action_history WHERE user = ?1", params![login])?;
        tx.execute("DELETE FROM user_contacts WHERE contact_owner = ?1", params![login])?;
        tx.execute("DELETE FROM user_contacts WHERE contact = ?1", params![login])?;
        tx.execute("DELETE FROM all_users WHERE login = ?1", params![login])?;

        tx.commit()?;

        logging::debug!(self.log, "user removed"; "login" => %login);

        Ok(())
    }

    pub fn change_password(&self, login: &str, password_hash: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE all_users SET password_hash = ?2 WHERE login = ?1",
            params![login, password_hash],
        )?;

        Ok(())
    }

    /// Records a successful authentication: refreshes the stored public key
    /// and last-login time, opens the active session and appends to the
    /// login history.
    pub fn login_user(
        &self,
        login: &str,
        ip: &str,
        port: u16,
        public_key: &str,
    ) -> rusqlite::Result<()> {
        let now = time::now();

        self.conn.execute(
            "UPDATE all_users SET last_login = ?2, public_key = ?3 WHERE login = ?1",
            params![login, now, public_key],
        )?;
        self.conn.execute(
            "INSERT INTO active_users (user, ip_address, port, last_active) \
             VALUES (?1, ?2, ?3, ?4)",
            params![login, ip, port, now],
        )?;
        self.conn.execute(
            "INSERT INTO user_login_history (user, ip_address, port, last_active) \
             VALUES (?1, ?2, ?3, ?4)",
            params![login, ip, port, now],
        )?;

        logging::debug!(self.log, "user logged in"; "login" => %login, "ip" => %ip, "port" => port);

        Ok(())
    }

    /// Closes the user's active session, if any.
    pub fn logout_user(&self, login: &str) -> rusqlite::Result<()> {
        self.conn
            .execute("DELETE FROM active_users WHERE user = ?1", params![login])?;

        Ok(())
    }

    pub fn user_exists(&self, login: &str) -> rusqlite::Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM all_users WHERE login = ?1",
                params![login],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    pub fn password_hash_of(&self, login: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT password_hash FROM all_users WHERE login = ?1",
                params![login],
                |row| row.get(0),
            )
            .optional()
    }

    /// The stored public key, if the user has logged in at least once.
    pub fn public_key_of(&self, login: &str) -> rusqlite::Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT public_key FROM all_users WHERE login = ?1",
                params![login],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    /// Idempotent insert. The contact is not checked for existence.
    pub fn add_contact(&self, owner: &str, contact: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO user_contacts (contact_owner, contact) VALUES (?1, ?2)",
            params![owner, contact],
        )?;

        Ok(())
    }

    /// Idempotent delete.
    pub fn remove_contact(&self, owner: &str, contact: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "DELETE FROM user_contacts WHERE contact_owner = ?1 AND contact = ?2",
            params![owner, contact],
        )?;

        Ok(())
    }

    /// Contacts of `owner` that are themselves registered users.
    pub fn contacts_of(&self, owner: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.contact FROM user_contacts c \
             JOIN all_users u ON c.contact = u.login \
             WHERE c.contact_owner = ?1 ORDER BY c.id",
        )?;
        let rows = stmt.query_map(params![owner], |row| row.get(0))?;

        rows.collect()
    }

    pub fn all_users(&self) -> rusqlite::Result<Vec<UserSummary>> {
        let mut stmt =
            self.conn.prepare("SELECT login, last_login FROM all_users ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserSummary {
                login: row.get(0)?,
                last_login: row.get(1)?,
            })
        })?;

        rows.collect()
    }

    pub fn active_users(&self) -> rusqlite::Result<Vec<ActiveSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT user, ip_address, port, last_active FROM active_users ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ActiveSession {
                login: row.get(0)?,
                ip: row.get(1)?,
                port: row.get(2)?,
                since: row.get(3)?,
            })
        })?;

        rows.collect()
    }

    /// Login history of one user, or of everyone when `login` is `None`.
    pub fn login_history(&self, login: Option<&str>) -> rusqlite::Result<Vec<LoginRecord>> {
        let map = |row: &rusqlite::Row| {
            Ok(LoginRecord {
                login: row.get(0)?,
                ip: row.get(1)?,
                port: row.get(2)?,
                when: row.get(3)?,
            })
        };

        match login {
            Some(login) => {
                let mut stmt = self.conn.prepare(
                    "SELECT user, ip_address, port, last_active FROM user_login_history \
                     WHERE user = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![login], map)?;
                rows.collect()
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT user, ip_address, port, last_active FROM user_login_history \
                     ORDER BY id",
                )?;
                let rows = stmt.query_map([], map)?;
                rows.collect()
            }
        }
    }

    /// Bumps the routing counters of both ends of a delivered message.
    pub fn bump_counters(&self, sender: &str, recipient: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE user_action_history SET sent_messages = sent_messages + 1 WHERE user = ?1",
            params![sender],
        )?;
        self.conn.execute(
            "UPDATE user_action_history SET received_messages = received_messages + 1 \
             WHERE user = ?1",
            params![recipient],
        )?;

        Ok(())
    }

    pub fn message_counters(&self) -> rusqlite::Result<Vec<CounterRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.login, u.last_login, h.sent_messages, h.received_messages \
             FROM user_action_history h JOIN all_users u ON h.user = u.login ORDER BY u.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CounterRow {
                login: row.get(0)?,
                last_login: row.get(1)?,
                sent: row.get(2)?,
                received: row.get(3)?,
            })
        })?;

        rows.collect()
    }
}
