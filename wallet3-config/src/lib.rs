#![forbid(unsafe_code)]
//! Configuration for the wallet3 sync engine and transaction constructor.
use std::{
    io::{self, Error, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};

use log::LevelFilter;
use log4rs::{
    append::rolling_file::{
        policy::compound::{
            roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
        },
        RollingFileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

pub const DEFAULT_DAEMON_ADDRESS: &str = "ipc://oxend.sock";
pub const DEFAULT_WALLET_NAME: &str = "wallet3.sqlite";
pub const DEFAULT_LOGFILE_NAME: &str = "wallet3.debug.log";
pub const DEFAULT_DEREGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Rolled log files kept next to the live one
const LOG_ROLL_WINDOW: u32 = 3;
/// Size at which the log file is rolled
const LOG_ROLL_SIZE: u64 = 5 * 1024 * 1024;
const LOG_PATTERN: &str = "{d} {l} {t}::{m}{n}";

/// Ring members per input, the real output included.
pub const DEFAULT_RING_SIZE: usize = 10;
/// Blocks an ordinary output must age before it can be spent.
pub const DEFAULT_SPENDABLE_AGE: u64 = 10;
/// Blocks a coinbase output must age before it can be spent.
pub const DEFAULT_COINBASE_UNLOCK_WINDOW: u64 = 30;
pub const DEFAULT_MAX_FINALISE_ATTEMPTS: usize = 8;

/// Connection settings for the daemon the wallet syncs from.
#[derive(Clone, Debug, PartialEq)]
pub struct DaemonConfig {
    pub address: String,
    /// How long `deregister` waits for the daemon to confirm removal.
    pub deregister_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_DAEMON_ADDRESS.to_string(),
            deregister_timeout: DEFAULT_DEREGISTER_TIMEOUT,
        }
    }
}

/// Order in which spendable outputs are offered to input selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Largest amount first, older first among equal amounts. Minimises input count.
    #[default]
    LargestFirst,
    /// Oldest first, larger first among outputs of the same height.
    OldestFirst,
}

/// Knobs for building outgoing transactions.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstructionConfig {
    pub ring_size: usize,
    pub selection_policy: SelectionPolicy,
    /// Bound on the re-select loop run when attached decoys push the fee past the inputs.
    pub max_finalise_attempts: usize,
    pub spendable_age: u64,
    pub coinbase_unlock_window: u64,
}

impl Default for ConstructionConfig {
    fn default() -> Self {
        Self {
            ring_size: DEFAULT_RING_SIZE,
            selection_policy: SelectionPolicy::default(),
            max_finalise_attempts: DEFAULT_MAX_FINALISE_ATTEMPTS,
            spendable_age: DEFAULT_SPENDABLE_AGE,
            coinbase_unlock_window: DEFAULT_COINBASE_UNLOCK_WINDOW,
        }
    }
}

/// Configuration data that is necessary and sufficient for the creation of a Wallet.
#[derive(Clone, Debug)]
pub struct WalletConfig {
    pub daemon: DaemonConfig,
    pub construction: ConstructionConfig,
    pub network: Network,
    /// The directory where the wallet and logfiles will be created. By default, this will be in ~/.oxen/wallets.
    pub wallet_dir: Option<PathBuf>,
    /// The filename of the wallet database. This will be created in the `wallet_dir`.
    pub wallet_name: PathBuf,
    /// The filename of the logfile. This will be created in the `wallet_dir`.
    pub logfile_name: PathBuf,
    /// Least severe level written to the logfile.
    pub log_level: LevelFilter,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self::create_unconnected(Network::Mainnet, None)
    }
}

impl WalletConfig {
    // Create an unconnected (to any daemon) config to test for local wallet etc...
    pub fn create_unconnected(network: Network, dir: Option<PathBuf>) -> WalletConfig {
        WalletConfig {
            daemon: DaemonConfig::default(),
            construction: ConstructionConfig::default(),
            network,
            wallet_dir: dir,
            wallet_name: DEFAULT_WALLET_NAME.into(),
            logfile_name: DEFAULT_LOGFILE_NAME.into(),
            log_level: LevelFilter::Info,
        }
    }

    pub fn set_data_dir(&mut self, dir_str: String) {
        self.wallet_dir = Some(PathBuf::from(dir_str));
    }

    /// Rolling logfile in the wallet directory. Rolled files sit next to it as `<logfile>.N`.
    pub fn get_log_config(&self) -> io::Result<Config> {
        let log_path = self.get_log_path()?;
        let roller = FixedWindowRoller::builder()
            .build(&format!("{}.{{}}", log_path.display()), LOG_ROLL_WINDOW)
            .map_err(log_error)?;
        let policy = CompoundPolicy::new(
            Box::new(SizeTrigger::new(LOG_ROLL_SIZE)),
            Box::new(roller),
        );
        let logfile = RollingFileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(&log_path, Box::new(policy))?;

        Config::builder()
            .appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(self.log_level)))
                    .build("logfile", Box::new(logfile)),
            )
            .build(Root::builder().appender("logfile").build(self.log_level))
            .map_err(log_error)
    }

    /// Installs the logfile as the process logger. The engine's `tracing` events reach it through
    /// `log` when no subscriber is set. Fails if a logger is already installed.
    pub fn init_logging(&self) -> io::Result<log4rs::Handle> {
        let handle = log4rs::init_config(self.get_log_config()?).map_err(log_error)?;
        log::info!(
            "Logging {} wallet to {}",
            self.network,
            self.get_log_path()?.display()
        );
        Ok(handle)
    }

    /// Resolves (and creates) the wallet directory for the configured network.
    pub fn get_wallet_dir(&self) -> io::Result<Box<Path>> {
        let mut wallet_location = match &self.wallet_dir {
            Some(dir) => dir.clone(),
            None => {
                let mut location = dirs::home_dir().ok_or_else(|| {
                    Error::new(ErrorKind::NotFound, "Couldn't determine home directory")
                })?;
                location.push(".oxen");
                location
            }
        };
        if self.wallet_dir.is_none() {
            if let Some(subdir) = self.network.data_subdir() {
                wallet_location.push(subdir);
            }
            wallet_location.push("wallets");
        }

        std::fs::create_dir_all(&wallet_location)?;

        Ok(wallet_location.into_boxed_path())
    }

    pub fn get_wallet_path(&self) -> io::Result<Box<Path>> {
        let mut wallet_location = self.get_wallet_dir()?.into_path_buf();
        wallet_location.push(&self.wallet_name);

        Ok(wallet_location.into_boxed_path())
    }

    pub fn wallet_exists(&self) -> bool {
        self.get_wallet_path()
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    pub fn get_log_path(&self) -> io::Result<Box<Path>> {
        let mut log_path = self.get_wallet_dir()?.into_path_buf();
        log_path.push(&self.logfile_name);

        Ok(log_path.into_boxed_path())
    }
}

fn log_error(error: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::Other, error.to_string())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Devnet,
    Fakechain,
}

impl Network {
    /// Target seconds between blocks.
    pub fn target_block_time(&self) -> u64 {
        match self {
            Network::Mainnet | Network::Testnet | Network::Devnet => 120,
            Network::Fakechain => 1,
        }
    }

    fn data_subdir(&self) -> Option<&'static str> {
        match self {
            Network::Mainnet => None,
            Network::Testnet => Some("testnet"),
            Network::Devnet => Some("devnet"),
            Network::Fakechain => Some("fakechain"),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Network::*;
        let name = match self {
            Mainnet => "mainnet",
            Testnet => "testnet",
            Devnet => "devnet",
            Fakechain => "fakechain",
        };
        write!(f, "{name}")
    }
}
