use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, TransactionRequest};
use log::debug;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::evm::provider_error;
use super::Signer;
use crate::{Error, Result};

/// Signs EVM bridge calls with a local private key. The payload is calldata
/// for the bridge contract; gas, fees and nonce come from the node.
pub struct EvmWalletSigner {
    wallet: LocalWallet,
    provider: Provider<Http>,
    bridge: EthAddress,
}

impl EvmWalletSigner {
    pub fn new(private_key: &str, chain_id: u64, provider: Provider<Http>, bridge: EthAddress) -> Result<Self> {
        let wallet = private_key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| Error::Config(format!("Invalid EVM private key: {}", e)))?
            .with_chain_id(chain_id);
        Ok(Self {
            wallet,
            provider,
            bridge,
        })
    }

    pub fn address(&self) -> EthAddress {
        self.wallet.address()
    }
}

#[async_trait]
impl Signer for EvmWalletSigner {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(self.bridge)
            .data(payload.to_vec())
            .into();
        tx.set_chain_id(self.wallet.chain_id());
        // 估算 gas 时合约 revert 属于提交失败
        self.provider
            .fill_transaction(&mut tx, None)
            .await
            .map_err(|e| match provider_error("fill transaction", e) {
                Error::Chain(reason) => Error::Submission(reason),
                other => other,
            })?;
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| Error::Submission(format!("signing failed: {}", e)))?;
        debug!("signed bridge call from {:?}", self.wallet.address());
        Ok(tx.rlp_signed(&signature).to_vec())
    }
}

/// Delegates signing to an external program: the unsigned payload is
/// written to its stdin as hex, the signed bytes are read back from stdout
/// as hex.
#[derive(Debug, Clone)]
pub struct CommandSigner {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

impl CommandSigner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, payload: &[u8]) -> Result<std::process::Output> {
        let spawn_error =
            |e: std::io::Error| Error::Network(format!("signer {}: {}", self.program.display(), e));
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(hex::encode(payload).as_bytes())
                .await
                .map_err(spawn_error)?;
        }
        child.wait_with_output().await.map_err(spawn_error)
    }
}

#[async_trait]
impl Signer for CommandSigner {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let output = tokio::time::timeout(self.timeout, self.run(payload))
            .await
            .map_err(|_| Error::Network(format!("signer timed out after {:?}", self.timeout)))??;
        if !output.status.success() {
            return Err(Error::Submission(format!(
                "signer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let signed = stdout.trim().trim_start_matches("0x");
        hex::decode(signed).map_err(|e| Error::Submission(format!("signer printed invalid hex: {}", e)))
    }
}
