//! Protocol parameters.
//!
//! Everything the engine cannot infer from state (asset credit rates, the
//! proposal threshold, quorum, voting period) is injected through
//! [`ProtocolConfig`], read from a JSON file with defaults for omitted keys.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::silo::{AssetId, AssetParams, Epoch, RootsEngine, Silo};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "SILO_CONFIG";

pub const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// How a cast vote's weight reacts to later root changes of the voter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteWeighting {
    /// Weight is the voter's roots at cast time, never revised.
    #[default]
    Snapshot,
    /// Weight follows the voter's roots while the proposal is active.
    Live,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GovernanceParams {
    /// Share of total roots a proposer must hold, in basis points.
    #[serde(default = "default_propose_threshold_bps")]
    pub propose_threshold_bps: u32,
    /// Share of total roots voting for a proposal that passes it.
    #[serde(default = "default_quorum_bps")]
    pub quorum_bps: u32,
    /// Epochs a proposal stays open unless the proposer overrides it.
    #[serde(default = "default_voting_period")]
    pub voting_period: u32,
    /// Epochs after the start before quorum can pass a proposal.
    #[serde(default)]
    pub min_voting_epochs: u32,
    #[serde(default = "default_max_active_per_proposer")]
    pub max_active_per_proposer: Option<u32>,
    #[serde(default)]
    pub vote_weighting: VoteWeighting,
}

fn default_propose_threshold_bps() -> u32 {
    10
}

fn default_quorum_bps() -> u32 {
    5_000
}

fn default_voting_period() -> u32 {
    168
}

fn default_max_active_per_proposer() -> Option<u32> {
    Some(15)
}

impl Default for GovernanceParams {
    fn default() -> Self {
        Self {
            propose_threshold_bps: default_propose_threshold_bps(),
            quorum_bps: default_quorum_bps(),
            voting_period: default_voting_period(),
            min_voting_epochs: 0,
            max_active_per_proposer: default_max_active_per_proposer(),
            vote_weighting: VoteWeighting::default(),
        }
    }
}

impl GovernanceParams {
    pub fn validate(&self) -> Result<()> {
        if self.quorum_bps == 0 || u128::from(self.quorum_bps) > BPS_DENOMINATOR {
            return Err(ConfigError::Invalid(format!(
                "quorum_bps must be within 1..=10000, got {}",
                self.quorum_bps
            )));
        }
        if u128::from(self.propose_threshold_bps) > BPS_DENOMINATOR {
            return Err(ConfigError::Invalid(format!(
                "propose_threshold_bps must be at most 10000, got {}",
                self.propose_threshold_bps
            )));
        }
        if self.voting_period == 0 {
            return Err(ConfigError::Invalid("voting_period must be positive".into()));
        }
        if self.min_voting_epochs >= self.voting_period {
            return Err(ConfigError::Invalid(format!(
                "min_voting_epochs ({}) must be below voting_period ({})",
                self.min_voting_epochs, self.voting_period
            )));
        }
        if self.max_active_per_proposer == Some(0) {
            return Err(ConfigError::Invalid(
                "max_active_per_proposer must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolConfig {
    #[serde(default = "default_assets")]
    pub assets: BTreeMap<AssetId, AssetParams>,
    #[serde(default = "default_bootstrap_roots_per_stalk")]
    pub bootstrap_roots_per_stalk: u128,
    #[serde(default = "default_genesis_epoch")]
    pub genesis_epoch: Epoch,
    #[serde(default)]
    pub governance: GovernanceParams,
}

fn default_assets() -> BTreeMap<AssetId, AssetParams> {
    let mut assets = BTreeMap::new();
    assets.insert(
        "bean".to_string(),
        AssetParams {
            seeds_per_unit: 2,
            stalk_per_unit: 10_000,
        },
    );
    assets.insert(
        "bean-lp".to_string(),
        AssetParams {
            seeds_per_unit: 4,
            stalk_per_unit: 10_000,
        },
    );
    assets
}

fn default_bootstrap_roots_per_stalk() -> u128 {
    crate::silo::roots::DEFAULT_BOOTSTRAP_ROOTS_PER_STALK
}

fn default_genesis_epoch() -> Epoch {
    1
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            assets: default_assets(),
            bootstrap_roots_per_stalk: default_bootstrap_roots_per_stalk(),
            genesis_epoch: default_genesis_epoch(),
            governance: GovernanceParams::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Loads the file named by `SILO_CONFIG`, or the defaults when unset.
    pub fn from_env() -> Result<Self> {
        match env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            return Err(ConfigError::Invalid("at least one asset is required".into()));
        }
        for (asset, params) in &self.assets {
            if params.stalk_per_unit == 0 {
                return Err(ConfigError::Invalid(format!(
                    "asset {asset} must mint stalk per deposited unit"
                )));
            }
        }
        if self.bootstrap_roots_per_stalk == 0 {
            return Err(ConfigError::Invalid(
                "bootstrap_roots_per_stalk must be positive".into(),
            ));
        }
        self.governance.validate()
    }

    pub fn build_silo(&self) -> Silo {
        Silo::new(
            self.assets.clone(),
            self.genesis_epoch,
            RootsEngine::new(self.bootstrap_roots_per_stalk),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProtocolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.assets["bean"].seeds_per_unit, 2);
        assert_eq!(config.governance.vote_weighting, VoteWeighting::Snapshot);
    }

    #[test]
    fn omitted_keys_fall_back_to_defaults() {
        let config = ProtocolConfig::from_json(
            r#"{ "governance": { "quorum_bps": 6667, "vote_weighting": "live" } }"#,
        )
        .unwrap();
        assert_eq!(config.governance.quorum_bps, 6_667);
        assert_eq!(config.governance.voting_period, 168);
        assert_eq!(config.governance.vote_weighting, VoteWeighting::Live);
        assert_eq!(config.genesis_epoch, 1);
        assert!(config.assets.contains_key("bean"));
    }

    #[test]
    fn nonsensical_governance_is_rejected() {
        for json in [
            r#"{ "governance": { "quorum_bps": 0 } }"#,
            r#"{ "governance": { "quorum_bps": 10001 } }"#,
            r#"{ "governance": { "voting_period": 0 } }"#,
            r#"{ "governance": { "voting_period": 10, "min_voting_epochs": 10 } }"#,
            r#"{ "governance": { "max_active_per_proposer": 0 } }"#,
            r#"{ "assets": {} }"#,
            r#"{ "bootstrap_roots_per_stalk": 0 }"#,
        ] {
            assert!(
                matches!(ProtocolConfig::from_json(json), Err(ConfigError::Invalid(_))),
                "{json} should be rejected"
            );
        }
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ProtocolConfig::from_file("/nonexistent/silo.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/silo.json"));
    }
}
