use chrono::{DateTime, Utc};
use flare::time;
use rusqlite::{params, Connection};
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS contacts (
    id      INTEGER PRIMARY KEY,
    contact TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS existing_users (
    id    INTEGER PRIMARY KEY,
    login TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS message_history (
    id        INTEGER PRIMARY KEY,
    client    TEXT NOT NULL,
    direction TEXT NOT NULL,
    message   TEXT NOT NULL,
    datetime  TEXT NOT NULL
);
";

const MUTEX_POISONED: &str = "Client store mutex poisoned";

/// Direction of a history entry relative to this client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    fn parse(text: &str) -> Direction {
        match text {
            "in" => Direction::In,
            _ => Direction::Out,
        }
    }
}

/// One exchanged message as remembered locally.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub peer: String,
    pub direction: Direction,
    pub body: String,
    pub when: DateTime<Utc>,
}

/// Per-login local state: contacts, known users and message history.
/// Touched by both the UI thread and the receive thread, so every call
/// serialises on an internal mutex.
pub struct ClientStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for ClientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStore").finish_non_exhaustive()
    }
}

impl ClientStore {
    /// Opens `client_<login>.sqlite3` in the working directory. The contact
    /// table is emptied on every start; the next roster fetch repopulates
    /// it, which keeps contacts the server no longer knows from lingering.
    pub fn open(login: &str) -> rusqlite::Result<ClientStore> {
        ClientStore::from_conn(Connection::open(format!("client_{}.sqlite3", login))?)
    }

    pub fn open_in_memory() -> rusqlite::Result<ClientStore> {
        ClientStore::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> rusqlite::Result<ClientStore> {
        conn.execute_batch(SCHEMA)?;
        conn.execute("DELETE FROM contacts", [])?;

        Ok(ClientStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn add_contact(&self, contact: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect(MUTEX_POISONED);
        conn.execute(
            "INSERT OR IGNORE INTO contacts (contact) VALUES (?1)",
            params![contact],
        )?;

        Ok(())
    }

    pub fn delete_contact(&self, contact: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect(MUTEX_POISONED);
        conn.execute("DELETE FROM contacts WHERE contact = ?1", params![contact])?;

        Ok(())
    }

    pub fn clear_contacts(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect(MUTEX_POISONED);
        conn.execute("DELETE FROM contacts", [])?;

        Ok(())
    }

    pub fn get_contacts(&self) -> rusqlite::Result<Vec<String>> {
        let conn = self.conn.lock().expect(MUTEX_POISONED);
        let mut stmt = conn.prepare("SELECT contact FROM contacts ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        rows.collect()
    }

    /// Atomically replaces the known-user mirror with the server's list.
    pub fn replace_known_users(&self, users: &[String]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().expect(MUTEX_POISONED);
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM existing_users", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO existing_users (login) VALUES (?1)")?;
            for user in users {
                stmt.execute(params![user])?;
            }
        }

        tx.commit()
    }

    pub fn get_known_users(&self) -> rusqlite::Result<Vec<String>> {
        let conn = self.conn.lock().expect(MUTEX_POISONED);
        let mut stmt = conn.prepare("SELECT login FROM existing_users ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        rows.collect()
    }

    pub fn has_user(&self, login: &str) -> rusqlite::Result<bool> {
        self.exists("SELECT 1 FROM existing_users WHERE login = ?1", login)
    }

    pub fn has_contact(&self, login: &str) -> rusqlite::Result<bool> {
        self.exists("SELECT 1 FROM contacts WHERE contact = ?1", login)
    }

    fn exists(&self, query: &str, login: &str) -> rusqlite::Result<bool> {
        use rusqlite::OptionalExtension;

        let conn = self.conn.lock().expect(MUTEX_POISONED);
        Ok(conn
            .query_row(query, params![login], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Appends one history row, stamped with the local wall clock.
    pub fn append_history(
        &self,
        peer: &str,
        direction: Direction,
        body: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect(MUTEX_POISONED);
        conn.execute(
            "INSERT INTO message_history (client, direction, message, datetime) \
             VALUES (?1, ?2, ?3, ?4)",
            params![peer, direction.as_str(), body, time::now()],
        )?;

        Ok(())
    }

    /// Everything exchanged with `peer`, in chronological order. Consumers
    /// truncate for display.
    pub fn history_with(&self, peer: &str) -> rusqlite::Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().expect(MUTEX_POISONED);
        let mut stmt = conn.prepare(
            "SELECT client, direction, message, datetime FROM message_history \
             WHERE client = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![peer], |row| {
            Ok(HistoryEntry {
                peer: row.get(0)?,
                direction: Direction::parse(&row.get::<_, String>(1)?),
                body: row.get(2)?,
                when: row.get(3)?,
            })
        })?;

        rows.collect()
    }
}
