use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;

/// Runtime configuration for an endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Largest legal frame payload in bytes. A peer announcing more is a
    /// protocol violation and loses the connection.
    pub max_frame_size: usize,
    /// Size of the chunk used when reading off the socket.
    pub read_chunk_size: usize,
    /// Capacity of the readiness event buffer.
    pub events_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_frame_size: 16 * 1024 * 1024,
            read_chunk_size: 65536,
            events_capacity: 64,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        serdeconv::from_toml_file(path).expect("Error loading endpoint configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn test_default() {
        let config = Config::default();

        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.read_chunk_size, 65536);
        assert_eq!(config.events_capacity, 64);
    }

    #[test]
    fn test_load() {
        let path = env::temp_dir().join("conduit_config_load_test.toml");

        fs::write(
            &path,
            r#"
max_frame_size = 1024
read_chunk_size = 256
events_capacity = 8
"#,
        )
        .unwrap();

        let config = Config::load(&path);

        fs::remove_file(&path).unwrap();

        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.read_chunk_size, 256);
        assert_eq!(config.events_capacity, 8);
    }
}
