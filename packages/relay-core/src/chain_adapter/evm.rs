use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use ethers::abi::{ParamType, Token};
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, BlockNumber, Bytes, Filter, Log, TransactionRequest, H256, U256,
};
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use super::{Ledger, LedgerPage, LedgerReadPort, LedgerWritePort};
use crate::codec::{self, EncodeError, OP_EVM_DEPOSIT};
use crate::types::{
    Address, Cursor, DecodedEvent, EvmAddress, Inclusion, Proof, RawMessage, Receipt, TonAddress,
    TxId,
};
use crate::{DecodeError, Error, Result};

pub const DEPOSIT_EVENT: &str = "DepositEvent(uint64,address,bytes,uint256)";
pub const WITHDRAW_FN: &str =
    "withdraw(uint64,address,uint256,uint256[2],uint256[2][2],uint256[2],uint256[])";
pub const PROCESSED_NONCES_FN: &str = "processedNonces(uint64)";

const DEFAULT_INCLUSION_POLL: Duration = Duration::from_secs(3);

/// JSON-RPC client for the EVM bridge contract.
pub struct EvmAdapter {
    provider: Provider<Http>,
    bridge: EthAddress,
    confirmations: u64,
    max_block_range: u64,
    inclusion_poll: Duration,
}

/// JSON-RPC error responses are the node talking back; everything else is
/// transport.
pub(crate) fn provider_error(context: &str, e: ProviderError) -> Error {
    match e.as_error_response() {
        Some(rpc) => Error::Chain(format!("{}: {}", context, rpc.message)),
        None if e.as_serde_error().is_some() => Error::Chain(format!("{}: {}", context, e)),
        None => Error::Network(format!("{}: {}", context, e)),
    }
}

fn parse_eth_address(s: &str) -> Result<EthAddress> {
    s.parse::<EvmAddress>()
        .map(|a| EthAddress::from(a.0))
        .map_err(|e| Error::Config(e.to_string()))
}

fn ton_address_from_bytes(bytes: &[u8]) -> std::result::Result<TonAddress, DecodeError> {
    match bytes.len() {
        // workchain byte + account hash
        33 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes[1..]);
            Ok(TonAddress::new(bytes[0] as i8, hash))
        }
        // binary user-friendly form, checksum included
        36 => URL_SAFE.encode(bytes).parse(),
        _ => std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::InvalidAddress(format!("0x{}", hex::encode(bytes))))?
            .parse(),
    }
}

/// Re-encodes a `DepositEvent` log as an EVM deposit bridge message so both
/// ledgers feed the classifier the same layout.
pub fn normalize_deposit_log(log: &Log) -> Result<Vec<u8>> {
    let tokens = ethers::abi::decode(
        &[
            ParamType::Uint(64),
            ParamType::Address,
            ParamType::Bytes,
            ParamType::Uint(256),
        ],
        &log.data,
    )
    .map_err(|e| Error::Chain(format!("undecodable DepositEvent data: {}", e)))?;

    let (nonce, sender, ton, amount) = match tokens.as_slice() {
        [Token::Uint(nonce), Token::Address(sender), Token::Bytes(ton), Token::Uint(amount)] => {
            (*nonce, *sender, ton, *amount)
        }
        _ => return Err(Error::Chain("unexpected DepositEvent layout".into())),
    };
    if amount > U256::from(u128::MAX) {
        return Err(Error::Chain(format!("deposit amount {} out of range", amount)));
    }
    let event = DecodedEvent {
        opcode: OP_EVM_DEPOSIT,
        nonce: nonce.low_u64(),
        amount: amount.as_u128(),
        source_address: Address::Evm(EvmAddress(sender.0)),
        destination_address: Address::Ton(ton_address_from_bytes(ton)?),
        source_chain_id: None,
        destination_chain_id: None,
    };
    Ok(codec::encode(&event)?)
}

fn uint(value: &str) -> std::result::Result<Token, EncodeError> {
    U256::from_dec_str(value)
        .map(Token::Uint)
        .map_err(|_| EncodeError::ProofElement(value.to_string()))
}

fn pair(values: &[String], name: &'static str) -> std::result::Result<Token, EncodeError> {
    match values {
        [x, y, ..] => Ok(Token::FixedArray(vec![uint(x)?, uint(y)?])),
        _ => Err(EncodeError::ProofShape(name)),
    }
}

/// ABI calldata for the EVM bridge's `withdraw`.
///
/// Solidity verifiers take the G2 point `pi_b` with each coordinate pair
/// reversed relative to snarkjs.
pub fn withdraw_calldata(event: &DecodedEvent, proof: &Proof) -> std::result::Result<Vec<u8>, EncodeError> {
    let Address::Evm(recipient) = event.destination_address else {
        return Err(EncodeError::AddressKind {
            field: "destination address",
            expected: crate::types::AddressKind::Evm,
        });
    };
    let groth = &proof.proof;
    let b = match groth.pi_b.as_slice() {
        [row0, row1, ..] if row0.len() >= 2 && row1.len() >= 2 => Token::FixedArray(vec![
            Token::FixedArray(vec![uint(&row0[1])?, uint(&row0[0])?]),
            Token::FixedArray(vec![uint(&row1[1])?, uint(&row1[0])?]),
        ]),
        _ => return Err(EncodeError::ProofShape("pi_b")),
    };
    let signals = proof
        .public_signals
        .iter()
        .map(|s| uint(s))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let tokens = [
        Token::Uint(U256::from(event.nonce)),
        Token::Address(EthAddress::from(recipient.0)),
        Token::Uint(U256::from(event.amount)),
        pair(&groth.pi_a, "pi_a")?,
        b,
        pair(&groth.pi_c, "pi_c")?,
        Token::Array(signals),
    ];
    let mut data = ethers::utils::id(WITHDRAW_FN).to_vec();
    data.extend(ethers::abi::encode(&tokens));
    Ok(data)
}

impl EvmAdapter {
    pub fn new(rpc_url: &str, bridge: &str, confirmations: u64, max_block_range: u64) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| Error::Config(format!("Invalid EVM RPC url {}: {}", rpc_url, e)))?;
        Ok(Self {
            provider,
            bridge: parse_eth_address(bridge)?,
            confirmations,
            max_block_range: max_block_range.max(1),
            inclusion_poll: DEFAULT_INCLUSION_POLL,
        })
    }

    pub fn with_inclusion_poll(mut self, interval: Duration) -> Self {
        self.inclusion_poll = interval;
        self
    }

    pub fn provider(&self) -> &Provider<Http> {
        &self.provider
    }

    async fn safe_head(&self) -> Result<u64> {
        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| provider_error("eth_blockNumber", e))?;
        Ok(head.as_u64().saturating_sub(self.confirmations))
    }
}

#[async_trait]
impl LedgerReadPort for EvmAdapter {
    fn ledger(&self) -> Ledger {
        Ledger::Evm
    }

    async fn get_transactions(&self, address: &str, since: Cursor, _limit: usize) -> Result<LedgerPage> {
        let contract = parse_eth_address(address)?;
        let safe = self.safe_head().await?;
        // 未扫完的区块需要重读，poller 会过滤已交付的日志
        let from = if since.is_end_of_height() {
            since.height + 1
        } else {
            since.height
        };
        if from > safe {
            return Ok(LedgerPage::default());
        }
        let to = safe.min(from + self.max_block_range - 1);

        let filter = Filter::new()
            .address(contract)
            .event(DEPOSIT_EVENT)
            .from_block(BlockNumber::Number(from.into()))
            .to_block(BlockNumber::Number(to.into()));
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| provider_error("eth_getLogs", e))?;
        trace!("eth_getLogs {}..={} returned {} logs", from, to, logs.len());

        // 按交易聚合日志
        let mut by_tx: BTreeMap<H256, RawMessage> = BTreeMap::new();
        for log in logs {
            if log.removed == Some(true) {
                continue;
            }
            let (Some(block), Some(index), Some(tx_hash)) =
                (log.block_number, log.log_index, log.transaction_hash)
            else {
                warn!("skipping pending log without position");
                continue;
            };
            let cursor = Cursor::new(block.as_u64(), index.low_u64());
            let entry = by_tx.entry(tx_hash).or_insert_with(|| RawMessage {
                tx_id: format!("{:?}", tx_hash),
                timestamp: 0,
                cursor,
                bodies: Vec::new(),
            });
            entry.cursor = entry.cursor.max(cursor);
            match normalize_deposit_log(&log) {
                Ok(body) => entry.bodies.push(body),
                Err(e) => debug!("tx {:?} log {}: {}", tx_hash, index, e),
            }
        }
        let mut messages: Vec<RawMessage> = by_tx.into_values().collect();
        messages.sort_by_key(|m| m.cursor);

        Ok(LedgerPage {
            messages,
            scanned_to: Some(Cursor::end_of(to)),
            has_more: to < safe,
        })
    }

    async fn is_deployed(&self, address: &str) -> Result<bool> {
        let code = self
            .provider
            .get_code(parse_eth_address(address)?, None)
            .await
            .map_err(|e| provider_error("eth_getCode", e))?;
        Ok(!code.is_empty())
    }
}

#[async_trait]
impl LedgerWritePort for EvmAdapter {
    fn ledger(&self) -> Ledger {
        Ledger::Evm
    }

    async fn submit(&self, signed: &[u8]) -> Result<TxId> {
        let pending = self
            .provider
            .send_raw_transaction(Bytes::from(signed.to_vec()))
            .await
            .map_err(|e| match provider_error("eth_sendRawTransaction", e) {
                Error::Chain(reason) => Error::Submission(reason),
                other => other,
            })?;
        let hash = pending.tx_hash();
        debug!("EVM transaction sent: {:?}", hash);
        Ok(TxId(format!("{:?}", hash)))
    }

    async fn await_inclusion(&self, tx_id: &TxId, timeout: Duration) -> Result<Inclusion> {
        let hash: H256 = tx_id
            .0
            .parse()
            .map_err(|_| Error::Chain(format!("invalid transaction hash {}", tx_id)))?;
        let deadline = Instant::now() + timeout;
        loop {
            let receipt = self
                .provider
                .get_transaction_receipt(hash)
                .await
                .map_err(|e| provider_error("eth_getTransactionReceipt", e));
            match receipt {
                Ok(Some(receipt)) => {
                    if let Some(block) = receipt.block_number {
                        let head = self
                            .provider
                            .get_block_number()
                            .await
                            .map_err(|e| provider_error("eth_blockNumber", e))?;
                        if head.as_u64() >= block.as_u64() + self.confirmations {
                            let success = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
                            return Ok(Inclusion::Included(Receipt {
                                tx_id: tx_id.clone(),
                                success,
                                height: block.as_u64(),
                                reason: (!success).then(|| "execution reverted".to_string()),
                            }));
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => warn!("receipt check for {} failed: {}", tx_id, e),
                Err(e) => return Err(e),
            }
            if Instant::now() + self.inclusion_poll > deadline {
                return Ok(Inclusion::Timeout);
            }
            sleep(self.inclusion_poll).await;
        }
    }

    async fn effect_exists(&self, event: &DecodedEvent) -> Result<bool> {
        let mut data = ethers::utils::id(PROCESSED_NONCES_FN).to_vec();
        data.extend(ethers::abi::encode(&[Token::Uint(U256::from(event.nonce))]));
        let call: TypedTransaction = TransactionRequest::new().to(self.bridge).data(data).into();
        let out = self
            .provider
            .call(&call, None)
            .await
            .map_err(|e| provider_error("processedNonces", e))?;
        Ok(out.iter().any(|b| *b != 0))
    }
}
