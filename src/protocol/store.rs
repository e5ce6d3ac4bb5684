//! JSON state file: config, protocol state and the in-memory collaborators,
//! saved after every CLI invocation.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Protocol, ProtocolState};
use crate::config::{ConfigError, ProtocolConfig};
use crate::services::{InMemoryBank, RecordingExecutor};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed state file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateFile {
    pub config: ProtocolConfig,
    pub state: ProtocolState,
    #[serde(default)]
    pub bank: InMemoryBank,
    #[serde(default)]
    pub executor: RecordingExecutor,
}

impl StateFile {
    pub fn new(config: ProtocolConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let state = ProtocolState::new(&config);
        Ok(Self {
            config,
            state,
            bank: InMemoryBank::new(),
            executor: RecordingExecutor::new(),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: Self = serde_json::from_str(&raw)?;
        file.config.validate()?;
        Ok(file)
    }

    /// Writes to a sibling temp file first so a crash never leaves a
    /// truncated state file behind.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        let path = path.as_ref();
        let write_err = |source: std::io::Error| StoreError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let encoded = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, encoded).map_err(write_err)?;
        fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }

    pub fn into_protocol(self) -> (ProtocolConfig, Protocol<InMemoryBank, RecordingExecutor>) {
        let protocol = Protocol::from_parts(self.state, self.bank, self.executor);
        (self.config, protocol)
    }

    pub fn from_protocol(
        config: ProtocolConfig,
        protocol: Protocol<InMemoryBank, RecordingExecutor>,
    ) -> Self {
        let (state, bank, executor) = protocol.into_parts();
        Self {
            config,
            state,
            bank,
            executor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_survives_a_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("silo.json");

        let mut file = StateFile::new(ProtocolConfig::default()).unwrap();
        file.bank
            .credit_account(&"alice".to_string(), &"bean".to_string(), 1_000);
        let (config, mut protocol) = file.into_protocol();
        protocol
            .deposit(&"alice".to_string(), &"bean".to_string(), 250)
            .unwrap();
        protocol.advance_epoch(4, 0).unwrap();
        let root = protocol.state_root();
        StateFile::from_protocol(config, protocol).save(&path).unwrap();

        let (_, restored) = StateFile::load(&path).unwrap().into_protocol();
        assert_eq!(restored.state_root(), root);
        assert_eq!(restored.balance_of_seeds(&"alice".to_string()), 500);
        assert_eq!(
            restored.silo().balance_of_grown_stalk(&"alice".to_string()),
            1_500
        );
        assert_eq!(restored.transfer().escrow_of(&"bean".to_string()), 250);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silo.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(StateFile::load(&path), Err(StoreError::Parse(_))));
        assert!(matches!(
            StateFile::load(dir.path().join("missing.json")),
            Err(StoreError::Read { .. })
        ));
    }
}
