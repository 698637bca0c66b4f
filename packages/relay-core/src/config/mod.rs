use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain_adapter::Ledger;
use crate::relayer::direction::{EvmToTon, TonToEvm};
use crate::retry::RetryPolicy;
use crate::types::{ChainId, ChainPair, Cursor, EvmAddress, TonAddress};
use crate::{Error, Result};

fn default_processed_method() -> String {
    "is_processed".to_string()
}

fn default_confirmations() -> u64 {
    2
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_snarkjs_bin() -> String {
    "snarkjs".to_string()
}

fn default_prover_timeout() -> u64 {
    300
}

fn default_signer_timeout() -> u64 {
    30
}

fn default_directions() -> Vec<String> {
    vec![EvmToTon::NAME.to_string(), TonToEvm::NAME.to_string()]
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TonConfig {
    pub chain_id: ChainId,
    /// toncenter base url, e.g. `https://toncenter.com/api`.
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub bridge_address: String,
    /// Bridge get-method answering whether a nonce was already unlocked.
    #[serde(default = "default_processed_method")]
    pub processed_method: String,
    /// Logical time to start from when no cursor is stored.
    #[serde(default)]
    pub start_lt: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EvmConfig {
    pub chain_id: ChainId,
    pub rpc_url: String,
    pub bridge_address: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default)]
    pub start_block: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProverConfig {
    #[serde(default = "default_snarkjs_bin")]
    pub snarkjs_bin: String,
    /// Arguments placed before the snarkjs subcommand, e.g. `["snarkjs"]`
    /// when `snarkjs_bin` is `npx`.
    #[serde(default)]
    pub snarkjs_args: Vec<String>,
    pub wasm_file: PathBuf,
    pub zkey_file: PathBuf,
    pub verification_key: PathBuf,
    #[serde(default = "default_prover_timeout")]
    pub timeout_secs: u64,
}

impl ProverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where a destination ledger's signing capability comes from. Secrets are
/// never part of the file.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignerConfig {
    /// Hex private key read from the named environment variable.
    PrivateKey { env: String },
    /// External program, see `CommandSigner`.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_signer_timeout")]
        timeout_secs: u64,
    },
}

impl SignerConfig {
    pub fn private_key(&self) -> Result<Option<String>> {
        match self {
            SignerConfig::PrivateKey { env } => std::env::var(env)
                .map(Some)
                .map_err(|_| Error::Config(format!("Environment variable {} is not set", env))),
            SignerConfig::Command { .. } => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SignersConfig {
    #[serde(default)]
    pub ton: Option<SignerConfig>,
    #[serde(default)]
    pub evm: Option<SignerConfig>,
}

impl SignersConfig {
    pub fn for_ledger(&self, ledger: Ledger) -> Option<&SignerConfig> {
        match ledger {
            Ledger::Ton => self.ton.as_ref(),
            Ledger::Evm => self.evm.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RelayerConfig {
    /// Seconds to idle after a tick that found nothing more to read.
    pub poll_interval: u64,
    pub page_size: usize,
    pub max_proof_attempts: u32,
    pub max_submit_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Seconds to wait for a submitted transaction to be included.
    pub inclusion_timeout: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            poll_interval: 10,
            page_size: 50,
            max_proof_attempts: 5,
            max_submit_attempts: 5,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
            inclusion_timeout: 120,
        }
    }
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn inclusion_timeout(&self) -> Duration {
        Duration::from_secs(self.inclusion_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("zk-relay-db"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub ton: TonConfig,
    pub evm: EvmConfig,
    pub prover: ProverConfig,
    #[serde(default)]
    pub signers: SignersConfig,
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Directions to run; both by default.
    #[serde(default = "default_directions")]
    pub directions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// `.json` files are JSON, anything else is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Toml,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::parse(&config_str, Format::from_path(path))?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// Parses without validating.
    pub fn parse(raw: &str, format: Format) -> Result<Self> {
        match format {
            Format::Toml => toml::from_str(raw)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e))),
            Format::Json => serde_json::from_str(raw)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        // 验证链配置
        self.ton_bridge()?;
        self.evm_bridge()?;
        if self.ton.api_url.trim().is_empty() {
            return Err(Error::Config("TON api_url must be set".to_string()));
        }
        if self.evm.rpc_url.trim().is_empty() {
            return Err(Error::Config("EVM rpc_url must be set".to_string()));
        }
        if self.ton.chain_id == self.evm.chain_id {
            return Err(Error::Config(format!(
                "TON and EVM chain ids must differ, both are {}",
                self.ton.chain_id
            )));
        }

        // 验证中继器配置
        if self.relayer.poll_interval == 0 {
            return Err(Error::Config("Relayer poll interval must be greater than 0".to_string()));
        }
        if self.relayer.page_size == 0 {
            return Err(Error::Config("Relayer page size must be greater than 0".to_string()));
        }
        if self.relayer.max_proof_attempts == 0 || self.relayer.max_submit_attempts == 0 {
            return Err(Error::Config("Relayer attempt bounds must be greater than 0".to_string()));
        }
        if self.relayer.inclusion_timeout == 0 {
            return Err(Error::Config("Relayer inclusion timeout must be greater than 0".to_string()));
        }

        // 验证方向和签名者
        if self.directions.is_empty() {
            return Err(Error::Config("At least one direction must be enabled".to_string()));
        }
        for name in &self.directions {
            let destination = Self::destination_of(name)?;
            let signer = self.signers.for_ledger(destination).ok_or_else(|| {
                Error::Config(format!("Direction {} needs a {} signer", name, destination))
            })?;
            if destination == Ledger::Ton && matches!(signer, SignerConfig::PrivateKey { .. }) {
                return Err(Error::Config(
                    "TON signing must be delegated to a command signer".to_string(),
                ));
            }
            signer.private_key()?;
        }

        // 验证证明文件
        for (what, path) in [
            ("circuit wasm", &self.prover.wasm_file),
            ("proving key", &self.prover.zkey_file),
            ("verification key", &self.prover.verification_key),
        ] {
            if !path.is_file() {
                return Err(Error::Config(format!("Missing {} file: {}", what, path.display())));
            }
        }
        if self.prover.timeout_secs == 0 {
            return Err(Error::Config("Prover timeout must be greater than 0".to_string()));
        }

        Ok(())
    }

    fn destination_of(direction: &str) -> Result<Ledger> {
        match direction {
            EvmToTon::NAME => Ok(Ledger::Ton),
            TonToEvm::NAME => Ok(Ledger::Evm),
            other => Err(Error::Config(format!("Unknown direction: {}", other))),
        }
    }

    pub fn ton_bridge(&self) -> Result<TonAddress> {
        self.ton.bridge_address.parse().map_err(|e| {
            Error::Config(format!("Invalid TON bridge address {}: {}", self.ton.bridge_address, e))
        })
    }

    pub fn evm_bridge(&self) -> Result<EvmAddress> {
        self.evm.bridge_address.parse().map_err(|e| {
            Error::Config(format!("Invalid EVM bridge address {}: {}", self.evm.bridge_address, e))
        })
    }

    pub fn is_enabled(&self, direction: &str) -> bool {
        self.directions.iter().any(|d| d == direction)
    }

    /// Source and destination chain ids for a direction name.
    pub fn chain_pair(&self, direction: &str) -> Result<ChainPair> {
        match direction {
            EvmToTon::NAME => Ok(ChainPair {
                source: self.evm.chain_id,
                destination: self.ton.chain_id,
            }),
            TonToEvm::NAME => Ok(ChainPair {
                source: self.ton.chain_id,
                destination: self.evm.chain_id,
            }),
            other => Err(Error::Config(format!("Unknown direction: {}", other))),
        }
    }

    /// Cursor used when the store holds none for `direction`.
    pub fn start_cursor(&self, direction: &str) -> Cursor {
        match direction {
            EvmToTon::NAME if self.evm.start_block > 0 => Cursor::end_of(self.evm.start_block - 1),
            TonToEvm::NAME => Cursor::at_height(self.ton.start_lt),
            _ => Cursor::ZERO,
        }
    }
}
