use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lowest port the bootstrap accepts; everything below is reserved.
pub const MIN_PORT: u16 = 1024;

/// Server bootstrap settings, read from a TOML file in the working
/// directory. Missing keys fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub db_path: String,
    pub db_file: String,
    pub default_port: u16,
    /// Empty means accept from any address.
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            db_path: String::new(),
            db_file: "brokerdb.sqlite3".to_owned(),
            default_port: flare::DEFAULT_PORT,
            listen_address: String::new(),
        }
    }
}

impl ServerConfig {
    /// Loads the config file, falling back to defaults when it is missing.
    pub fn load(path: &Path) -> Result<ServerConfig, serdeconv::Error> {
        if !path.exists() {
            return Ok(ServerConfig::default());
        }

        serdeconv::from_toml_file(path)
    }

    pub fn db_file_path(&self) -> PathBuf {
        Path::new(&self.db_path).join(&self.db_file)
    }
}

/// Validates a listening port per the deployment contract (1024-65535).
pub fn valid_port(port: u16) -> bool {
    port >= MIN_PORT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = ServerConfig::load(Path::new("no-such-config.toml")).unwrap();

        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.default_port, 7777);
        assert!(config.listen_address.is_empty());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = env::temp_dir().join(format!("broker-config-{}.toml", std::process::id()));
        fs::write(&path, "default_port = 9000\nlisten_address = \"127.0.0.1\"\n").unwrap();

        let config = ServerConfig::load(&path).unwrap();

        assert_eq!(config.default_port, 9000);
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.db_file, "brokerdb.sqlite3");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_db_file_path_joins_components() {
        let config = ServerConfig {
            db_path: "/var/lib/broker".to_owned(),
            ..ServerConfig::default()
        };

        assert_eq!(
            config.db_file_path(),
            Path::new("/var/lib/broker/brokerdb.sqlite3")
        );
    }

    #[test]
    fn test_port_bounds() {
        assert!(!valid_port(0));
        assert!(!valid_port(1023));
        assert!(valid_port(1024));
        assert!(valid_port(65535));
    }
}
