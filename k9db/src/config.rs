//! Database configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Toml(#[from] toml::de::Error),
}

/// The only configuration the core needs: a database name and a filesystem
/// path for the key-value store.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub name: String,
    pub path: PathBuf,
    /// Dataflow worker partitions.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Apply dataflow batches synchronously on the committing thread
    /// instead of on per-partition workers.
    #[serde(default = "default_consistent")]
    pub consistent: bool,
}

fn default_workers() -> usize {
    3
}

fn default_consistent() -> bool {
    true
}

impl Config {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Config {
            name: name.into(),
            path: path.into(),
            workers: default_workers(),
            consistent: default_consistent(),
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Directory holding this database's store.
    pub fn db_path(&self) -> PathBuf {
        self.path.join(format!("{}.db", self.name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_toml() {
        let config: Config = toml::from_str(
            r#"
            name = "shop"
            path = "/tmp/k9db"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "shop");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/k9db/shop.db"));
        assert_eq!(config.workers, 3);
    }
}
