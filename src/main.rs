use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use silo_gov::silo::Crate;
use silo_gov::{
    AccountId, Amount, AssetId, ChangePayload, Command, Epoch, InMemoryBank, Protocol,
    ProtocolConfig, ProposalId, RecordingExecutor, StateFile,
};

#[derive(Parser)]
#[command(name = "silo", author, version, about = "Silo staking ledger and BIP governance")]
struct Cli {
    /// Protocol state file
    #[arg(long, global = true, default_value = "silo.state.json")]
    state: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a fresh state file
    Init {
        /// JSON config; falls back to $SILO_CONFIG, then defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing state file
        #[arg(long)]
        force: bool,
    },
    /// Credit an account's wallet outside the Silo
    Fund {
        account: AccountId,
        asset: AssetId,
        amount: Amount,
    },
    /// Deposit into the current epoch's crate
    Deposit {
        account: AccountId,
        asset: AssetId,
        amount: Amount,
    },
    /// Withdraw from the crate deposited at `epoch`
    Withdraw {
        account: AccountId,
        asset: AssetId,
        epoch: Epoch,
        amount: Amount,
    },
    /// Advance the epoch clock
    Advance {
        epoch: Epoch,
        /// Stalk minted by supply growth this epoch
        #[arg(long, default_value_t = 0)]
        supply_growth: u128,
    },
    /// Open a BIP
    Propose {
        proposer: AccountId,
        /// Hex-encoded change-set
        #[arg(long, default_value = "0x")]
        payload: String,
        /// Voting period in epochs
        #[arg(long)]
        period: Option<u32>,
    },
    /// Vote for a BIP with current roots
    Vote { voter: AccountId, proposal: ProposalId },
    /// Withdraw a vote
    Unvote { voter: AccountId, proposal: ProposalId },
    /// Check quorum and expiry of a BIP
    Tally { proposal: ProposalId },
    /// Execute a passed BIP
    Execute { proposal: ProposalId },
    /// Apply a JSON-lines file of commands in order
    Apply { commands: PathBuf },
    /// Print state
    Show {
        #[command(subcommand)]
        what: ShowCommands,
    },
}

#[derive(Subcommand)]
enum ShowCommands {
    /// Stalk, seeds, roots and crates per account
    Balances { account: Option<AccountId> },
    /// Every proposal with its tally
    Proposals,
    /// Totals and the state root
    Root,
}

#[derive(Serialize)]
struct AccountView {
    account: AccountId,
    stalk: u128,
    grown_stalk: u128,
    earned_stalk: u128,
    seeds: u128,
    roots: u128,
    crates: Vec<Crate>,
}

type CliProtocol = Protocol<InMemoryBank, RecordingExecutor>;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load(path: &Path) -> Result<(ProtocolConfig, CliProtocol)> {
    let file = StateFile::load(path).context("loading state (run `silo init` first?)")?;
    Ok(file.into_protocol())
}

fn save(path: &Path, config: ProtocolConfig, protocol: CliProtocol) -> Result<()> {
    StateFile::from_protocol(config, protocol).save(path)?;
    Ok(())
}

fn account_view(protocol: &CliProtocol, account: &AccountId) -> AccountView {
    let silo = protocol.silo();
    let crates = silo
        .assets()
        .keys()
        .flat_map(|asset| silo.crates(account, asset))
        .collect();
    AccountView {
        account: account.clone(),
        stalk: silo.balance_of_stalk(account),
        grown_stalk: silo.balance_of_grown_stalk(account),
        earned_stalk: silo.balance_of_earned_stalk(account),
        seeds: silo.balance_of_seeds(account),
        roots: silo.balance_of_roots(account),
        crates,
    }
}

fn read_commands(path: &Path) -> Result<Vec<Command>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut commands = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let command = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: malformed command", path.display(), index + 1))?;
        commands.push(command);
    }
    Ok(commands)
}

fn init(path: &Path, config: Option<PathBuf>, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    let config = match config {
        Some(config) => ProtocolConfig::from_file(config)?,
        None => ProtocolConfig::from_env()?,
    };
    StateFile::new(config)?.save(path)?;
    info!(state = %path.display(), "initialised");
    Ok(())
}

fn show(path: &Path, what: ShowCommands) -> Result<()> {
    let (_, protocol) = load(path)?;
    match what {
        ShowCommands::Balances { account } => {
            let accounts: Vec<AccountId> = match account {
                Some(account) => vec![account],
                None => protocol
                    .silo()
                    .ledger()
                    .accounts()
                    .map(|(account, _)| account.clone())
                    .collect(),
            };
            let views: Vec<AccountView> = accounts
                .iter()
                .map(|account| account_view(&protocol, account))
                .collect();
            print_json(&views)
        }
        ShowCommands::Proposals => print_json(&protocol.governance().proposals()),
        ShowCommands::Root => print_json(&protocol.snapshot()),
    }
}

/// Loads the state, applies one transition and saves it back.
fn transition(path: &Path, command: Commands) -> Result<()> {
    let (config, mut protocol) = load(path)?;
    match command {
        Commands::Init { .. } | Commands::Show { .. } => bail!("not a state transition"),
        Commands::Fund {
            account,
            asset,
            amount,
        } => {
            protocol.silo().asset(&asset)?;
            protocol.transfer_mut().credit_account(&account, &asset, amount);
        }
        Commands::Deposit {
            account,
            asset,
            amount,
        } => {
            let receipt = protocol.deposit(&account, &asset, amount)?;
            println!(
                "deposited {amount} {asset} at epoch {}: +{} stalk, +{} seeds, +{} roots",
                receipt.epoch, receipt.delta.stalk, receipt.delta.seeds, receipt.roots.minted
            );
        }
        Commands::Withdraw {
            account,
            asset,
            epoch,
            amount,
        } => {
            let receipt = protocol.withdraw(&account, &asset, epoch, amount)?;
            println!(
                "withdrew {amount} {asset} from epoch {epoch}: -{} stalk, -{} seeds, -{} roots",
                receipt.delta.stalk, receipt.delta.seeds, receipt.roots.burned
            );
        }
        Commands::Advance {
            epoch,
            supply_growth,
        } => {
            for (id, status) in protocol.advance_epoch(epoch, supply_growth)? {
                println!("bip {id}: {status:?}");
            }
        }
        Commands::Propose {
            proposer,
            payload,
            period,
        } => {
            let payload = ChangePayload::from_hex(&payload).context("decoding --payload")?;
            let id = protocol.propose(&proposer, payload, period)?;
            println!("proposed bip {id}");
        }
        Commands::Vote { voter, proposal } => {
            let status = protocol.vote(&voter, proposal)?;
            println!("bip {proposal}: {status:?}");
        }
        Commands::Unvote { voter, proposal } => {
            let roots = protocol.unvote(&voter, proposal)?;
            println!("removed {roots} roots from bip {proposal}");
        }
        Commands::Tally { proposal } => {
            let status = protocol.tally(proposal)?;
            println!("bip {proposal}: {status:?}");
        }
        Commands::Execute { proposal } => {
            protocol.execute(proposal)?;
            println!("bip {proposal}: executed");
        }
        Commands::Apply { commands } => {
            let commands = read_commands(&commands)?;
            match protocol.apply_all(&commands) {
                Ok(applied) => println!("applied {applied} commands"),
                Err((applied, err)) => {
                    // Commands before the rejected one stay applied.
                    save(path, config, protocol)?;
                    bail!("command {} rejected after {applied} applied: {err}", applied + 1);
                }
            }
        }
    }
    protocol.check_invariants()?;
    save(path, config, protocol)
}

fn run(cli: Cli) -> Result<()> {
    let path = cli.state;
    match cli.command {
        Commands::Init { config, force } => init(&path, config, force),
        Commands::Show { what } => show(&path, what),
        command => transition(&path, command),
    }
}

fn main() -> Result<()> {
    init_tracing();
    run(Cli::parse())
}
