//! Silo staking ledger and root-weighted BIP governance.
//!
//! Deposits sit in per-epoch crates and earn stalk (voting weight) and
//! seeds (stalk growth per epoch). Roots give each account a share of
//! total stalk that survives supply-growth rebases, and governance weighs
//! every vote in roots.

pub mod config;
pub mod governance;
pub mod protocol;
pub mod services;
pub mod silo;

pub use config::{GovernanceParams, ProtocolConfig, VoteWeighting};
pub use governance::{
    ChangePayload, Governance, GovernanceError, Proposal, ProposalId, ProposalStatus,
};
pub use protocol::{
    Command, Event, Protocol, ProtocolError, ProtocolState, StateFile, StateSnapshot, StoreError,
};
pub use services::{AssetTransfer, InMemoryBank, RecordingExecutor, UpgradeExecutor};
pub use silo::{AccountId, Amount, AssetId, Epoch, Silo, SiloError};
