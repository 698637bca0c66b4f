use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, trace, warn};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use super::{boc, http_error, Ledger, LedgerPage, LedgerReadPort, LedgerWritePort};
use crate::codec::{self, EncodeError, OP_TON_UNLOCK};
use crate::types::{Cursor, DecodedEvent, Inclusion, Proof, RawMessage, Receipt, TonAddress, TxId};
use crate::{Error, Result};

const DEFAULT_INCLUSION_POLL: Duration = Duration::from_secs(2);

/// Bag-of-cells body of the TON bridge's unlock message. The proof rides
/// in a referenced cell tree, so every cell stays within 1023 bits.
pub fn unlock_body(event: &DecodedEvent, proof: &Proof) -> std::result::Result<Vec<u8>, EncodeError> {
    if event.opcode != OP_TON_UNLOCK {
        return Err(EncodeError::UnknownOpcode(event.opcode));
    }
    Ok(boc::serialize(&codec::encode_cell(event, proof)?))
}

/// toncenter v3 HTTP client for the TON bridge account.
pub struct TonAdapter {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    bridge: TonAddress,
    processed_method: String,
    inclusion_poll: Duration,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: Vec<V3Transaction>,
}

#[derive(Debug, Deserialize)]
struct V3Transaction {
    hash: String,
    lt: String,
    #[serde(default)]
    now: u64,
    #[serde(default)]
    out_msgs: Vec<V3Message>,
    #[serde(default)]
    description: Option<V3Description>,
}

#[derive(Debug, Deserialize)]
struct V3Message {
    #[serde(default)]
    message_content: Option<V3MessageContent>,
}

#[derive(Debug, Deserialize)]
struct V3MessageContent {
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct V3Description {
    #[serde(default)]
    aborted: bool,
    #[serde(default)]
    compute_ph: Option<V3ComputePhase>,
}

#[derive(Debug, Deserialize)]
struct V3ComputePhase {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    message_hash: String,
}

#[derive(Debug, Deserialize)]
struct RunGetMethodResponse {
    exit_code: i64,
    #[serde(default)]
    stack: Vec<StackEntry>,
}

#[derive(Debug, Deserialize)]
struct StackEntry {
    #[serde(rename = "type")]
    kind: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AddressStateResponse {
    result: String,
}

impl V3Transaction {
    fn lt(&self) -> Result<u64> {
        self.lt
            .parse()
            .map_err(|_| Error::Chain(format!("bad lt {:?} in transaction {}", self.lt, self.hash)))
    }

    fn into_raw(self) -> Result<RawMessage> {
        let lt = self.lt()?;
        let mut bodies = Vec::new();
        for (i, msg) in self.out_msgs.iter().enumerate() {
            let Some(body) = msg.message_content.as_ref().and_then(|c| c.body.as_deref()) else {
                continue;
            };
            // 无法解析的 body 直接跳过，不影响整笔交易
            match STANDARD
                .decode(body)
                .map_err(|e| Error::Chain(e.to_string()))
                .and_then(|b| boc::root_cell_data(&b))
            {
                Ok(data) => bodies.push(data),
                Err(e) => debug!("tx {} out msg {}: unreadable body: {}", self.hash, i, e),
            }
        }
        Ok(RawMessage {
            tx_id: self.hash,
            timestamp: self.now,
            cursor: Cursor::at_height(lt),
            bodies,
        })
    }

    fn receipt(&self) -> Result<Receipt> {
        let description = self.description.as_ref();
        let compute = description.and_then(|d| d.compute_ph.as_ref());
        let aborted = description.map(|d| d.aborted).unwrap_or(false);
        let success = !aborted && compute.and_then(|c| c.success).unwrap_or(true);
        let reason = (!success).then(|| match compute.and_then(|c| c.exit_code) {
            Some(code) => format!("exit code {}", code),
            None => "transaction aborted".to_string(),
        });
        Ok(Receipt {
            tx_id: TxId(self.hash.clone()),
            success,
            height: self.lt()?,
            reason,
        })
    }
}

impl TonAdapter {
    pub fn new(api_url: &str, api_key: Option<String>, bridge: TonAddress, processed_method: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            bridge,
            processed_method: processed_method.to_string(),
            inclusion_poll: DEFAULT_INCLUSION_POLL,
        }
    }

    pub fn with_inclusion_poll(mut self, interval: Duration) -> Self {
        self.inclusion_poll = interval;
        self
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(format!("{}{}", self.api_url, path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(format!("{}{}", self.api_url, path)))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("X-API-Key", key),
            None => req,
        }
    }

    /// 5xx and 429 are transient; other non-success statuses are returned
    /// through `on_reject`.
    async fn checked(
        response: Response,
        context: &str,
        on_reject: fn(String) -> Error,
    ) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{}: HTTP {}: {}", context, status, body.trim());
        if status.is_server_error() || status.as_u16() == 429 {
            Err(Error::Network(message))
        } else {
            Err(on_reject(message))
        }
    }

    async fn transactions_by_message(&self, msg_hash: &str) -> Result<Vec<V3Transaction>> {
        let response = self
            .get("/v3/transactionsByMessage")
            .query(&[("msg_hash", msg_hash), ("direction", "in")])
            .send()
            .await
            .map_err(|e| http_error("transactionsByMessage", e))?;
        let response = Self::checked(response, "transactionsByMessage", Error::Chain).await?;
        let parsed: TransactionsResponse = response
            .json()
            .await
            .map_err(|e| http_error("transactionsByMessage", e))?;
        Ok(parsed.transactions)
    }
}

#[async_trait]
impl LedgerReadPort for TonAdapter {
    fn ledger(&self) -> Ledger {
        Ledger::Ton
    }

    async fn get_transactions(&self, address: &str, since: Cursor, limit: usize) -> Result<LedgerPage> {
        let start_lt = since.height.saturating_add(1).to_string();
        let limit_param = limit.to_string();
        let response = self
            .get("/v3/transactions")
            .query(&[
                ("account", address),
                ("start_lt", start_lt.as_str()),
                ("limit", limit_param.as_str()),
                ("sort", "asc"),
            ])
            .send()
            .await
            .map_err(|e| http_error("transactions", e))?;
        let response = Self::checked(response, "transactions", Error::Chain).await?;
        let parsed: TransactionsResponse = response
            .json()
            .await
            .map_err(|e| http_error("transactions", e))?;

        let has_more = parsed.transactions.len() >= limit;
        let messages = parsed
            .transactions
            .into_iter()
            .map(V3Transaction::into_raw)
            .collect::<Result<Vec<_>>>()?;
        trace!("toncenter returned {} transactions after lt {}", messages.len(), since.height);
        Ok(LedgerPage {
            messages,
            scanned_to: None,
            has_more,
        })
    }

    async fn is_deployed(&self, address: &str) -> Result<bool> {
        let response = self
            .get("/v2/getAddressState")
            .query(&[("address", address)])
            .send()
            .await
            .map_err(|e| http_error("getAddressState", e))?;
        let response = Self::checked(response, "getAddressState", Error::Chain).await?;
        let parsed: AddressStateResponse = response
            .json()
            .await
            .map_err(|e| http_error("getAddressState", e))?;
        Ok(parsed.result == "active")
    }
}

#[async_trait]
impl LedgerWritePort for TonAdapter {
    fn ledger(&self) -> Ledger {
        Ledger::Ton
    }

    async fn submit(&self, signed: &[u8]) -> Result<TxId> {
        let response = self
            .post("/v3/message")
            .json(&json!({ "boc": STANDARD.encode(signed) }))
            .send()
            .await
            .map_err(|e| http_error("send message", e))?;
        let response = Self::checked(response, "send message", Error::Submission).await?;
        let parsed: SendMessageResponse = response
            .json()
            .await
            .map_err(|e| http_error("send message", e))?;
        debug!("TON message accepted: {}", parsed.message_hash);
        Ok(TxId(parsed.message_hash))
    }

    async fn await_inclusion(&self, tx_id: &TxId, timeout: Duration) -> Result<Inclusion> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.transactions_by_message(&tx_id.0).await {
                Ok(txs) => {
                    if let Some(tx) = txs.first() {
                        return Ok(Inclusion::Included(tx.receipt()?));
                    }
                }
                Err(e) if e.is_transient() => warn!("inclusion check for {} failed: {}", tx_id, e),
                Err(e) => return Err(e),
            }
            if Instant::now() + self.inclusion_poll > deadline {
                return Ok(Inclusion::Timeout);
            }
            sleep(self.inclusion_poll).await;
        }
    }

    async fn effect_exists(&self, event: &DecodedEvent) -> Result<bool> {
        let response = self
            .post("/v3/runGetMethod")
            .json(&json!({
                "address": self.bridge.to_string(),
                "method": self.processed_method,
                "stack": [{ "type": "num", "value": format!("{:#x}", event.nonce) }],
            }))
            .send()
            .await
            .map_err(|e| http_error("runGetMethod", e))?;
        let response = Self::checked(response, "runGetMethod", Error::Chain).await?;
        let parsed: RunGetMethodResponse = response
            .json()
            .await
            .map_err(|e| http_error("runGetMethod", e))?;
        if parsed.exit_code != 0 {
            return Err(Error::Chain(format!(
                "{} exited with code {}",
                self.processed_method, parsed.exit_code
            )));
        }
        let flag = parsed
            .stack
            .first()
            .filter(|entry| entry.kind == "num")
            .and_then(|entry| entry.value.as_str())
            .ok_or_else(|| Error::Chain(format!("{} returned no number", self.processed_method)))?;
        Ok(!matches!(flag, "0x0" | "0" | "0x00"))
    }
}
