pub mod direction;

use backoff::backoff::Backoff;
use ethers::types::Address as EthAddress;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    chain_adapter::{CommandSigner, EvmAdapter, EvmWalletSigner, Ledger, LedgerReadPort, LedgerWritePort, Signer, TonAdapter},
    classifier::Classifier,
    config::{Config, SignerConfig},
    poller::{LedgerPoller, Poll},
    prover::{ProofPipeline, SnarkjsBackend, VerificationKey},
    retry::{retry_transient, RetryPolicy},
    store::{Admission, RelayStore, SledStore},
    submitter::{is_already_processed, Confirmation, OutboundSubmitter},
    types::{Address, Cursor, DecodedEvent, NonceKey, ProcessedRecord, Status},
    Error, Result,
};
use direction::{Direction, EvmToTon, TonToEvm};

/// Log target for conditions an operator has to act on.
pub const ALERT_TARGET: &str = "zk_relay::alert";

/// Where a direction loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Fetching,
    Classifying,
    Skip,
    Dedup,
    Proving,
    Submitting,
    Confirming,
    AdvanceCursor,
    Backoff,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub page_size: usize,
    pub max_proof_attempts: u32,
    pub max_submit_attempts: u32,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Used when the store holds no cursor for the direction yet.
    pub start_cursor: Cursor,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config, direction: &str) -> Self {
        Self {
            page_size: config.relayer.page_size,
            max_proof_attempts: config.relayer.max_proof_attempts,
            max_submit_attempts: config.relayer.max_submit_attempts,
            poll_interval: config.relayer.poll_interval(),
            retry: config.relayer.retry_policy(),
            start_cursor: config.start_cursor(direction),
        }
    }
}

/// One relay direction: poll, classify, prove, submit, confirm, advance.
pub struct DirectionOrchestrator {
    direction: Arc<dyn Direction>,
    poller: LedgerPoller,
    classifier: Classifier,
    store: Arc<dyn RelayStore>,
    prover: Arc<ProofPipeline>,
    submitter: OutboundSubmitter,
    settings: OrchestratorSettings,
    stage: Mutex<Stage>,
}

impl DirectionOrchestrator {
    pub fn new(
        direction: Arc<dyn Direction>,
        store: Arc<dyn RelayStore>,
        prover: Arc<ProofPipeline>,
        submitter: OutboundSubmitter,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            poller: LedgerPoller::new(direction.clone(), settings.page_size),
            classifier: Classifier::new([direction.deposit_opcode()]),
            direction,
            store,
            prover,
            submitter,
            settings,
            stage: Mutex::new(Stage::Idle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.direction.name()
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }

    fn enter(&self, stage: Stage) {
        let mut current = self.stage.lock();
        if *current != stage {
            trace!("{}: {:?} -> {:?}", self.name(), *current, stage);
            *current = stage;
        }
    }

    /// Runs until `cancel` fires. Cancellation is only observed while idle,
    /// so an event in flight is always carried to a persisted state.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            "{}: relaying {} -> {}",
            self.name(),
            self.direction.source_ledger(),
            self.direction.destination_ledger()
        );
        loop {
            self.enter(Stage::Idle);
            if cancel.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    error!(target: ALERT_TARGET, "{}: direction stopped: {}", self.name(), e);
                    return Err(e);
                }
            }
            self.enter(Stage::Idle);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        info!("{}: stopped", self.name());
        Ok(())
    }

    /// Reads and handles one page. Returns whether more history is waiting.
    pub async fn tick(&mut self) -> Result<bool> {
        let since = self
            .store
            .load_cursor(self.name())?
            .unwrap_or(self.settings.start_cursor);
        let poll = self.fetch(since).await?;
        if !poll.messages.is_empty() {
            debug!("{}: {} new transactions after {}", self.name(), poll.messages.len(), since);
        }

        for message in &poll.messages {
            self.enter(Stage::Classifying);
            let events = self.classifier.classify(message);
            if events.is_empty() {
                self.enter(Stage::Skip);
            }
            for event in &events {
                self.handle_event(event).await?;
            }
            // 交易内所有消息处理完才推进游标
            self.enter(Stage::AdvanceCursor);
            self.store.save_cursor(self.name(), message.cursor)?;
        }
        self.enter(Stage::AdvanceCursor);
        self.store.save_cursor(self.name(), poll.cursor)?;
        Ok(poll.has_more)
    }

    async fn fetch(&mut self, since: Cursor) -> Result<Poll> {
        let mut backoff = self.settings.retry.backoff();
        loop {
            self.enter(Stage::Fetching);
            match self.poller.poll(since).await {
                Ok(poll) => return Ok(poll),
                Err(e) if e.is_transient() => self.back_off(&mut backoff, &e).await,
                Err(e) => return Err(e),
            }
        }
    }

    async fn back_off(&self, backoff: &mut impl Backoff, reason: impl fmt::Display) {
        self.enter(Stage::Backoff);
        let wait = backoff.next_backoff().unwrap_or(self.settings.retry.max_delay);
        warn!("{}: {}; retrying in {:?}", self.name(), reason, wait);
        tokio::time::sleep(wait).await;
    }

    /// Carries one event from wherever its record stands to a terminal
    /// status.
    pub async fn handle_event(&self, event: &DecodedEvent) -> Result<()> {
        let chains = self.direction.resolve_chain_ids();
        let key = NonceKey::new(
            event.source_chain_id.unwrap_or(chains.source),
            event.opcode,
            event.nonce,
        );
        self.enter(Stage::Dedup);
        let mut record = match self.store.admit(key, event)? {
            Admission::Done(existing) => {
                debug!("{}: nonce {} already {}", self.name(), key, existing.status);
                return Ok(());
            }
            Admission::Resume(existing) => {
                info!("{}: resuming nonce {} at {}", self.name(), key, existing.status);
                existing
            }
            Admission::Fresh(record) => record,
        };

        // Grows across consecutive inclusion timeouts of this event.
        let mut timeouts = self.settings.retry.backoff();
        loop {
            record = match record.status {
                Status::Pending => self.prove(record).await?,
                Status::ProofOk => self.submit(record).await?,
                Status::Submitted => self.confirm(record, &mut timeouts).await?,
                Status::Confirmed | Status::Failed => return Ok(()),
            };
        }
    }

    /// Persists `next` if the stored record is still at `expected`. When
    /// another writer moved it first, continues from what it stored.
    fn transition(&self, expected: Status, next: ProcessedRecord) -> Result<ProcessedRecord> {
        if self.store.compare_and_set(expected, &next)? {
            if next.status != expected {
                debug!("{}: nonce {} {} -> {}", self.name(), next.key, expected, next.status);
            }
            return Ok(next);
        }
        let current = self
            .store
            .get(&next.key)?
            .ok_or_else(|| Error::Store(format!("record {} disappeared", next.key)))?;
        warn!(
            "{}: nonce {} moved to {} concurrently",
            self.name(),
            next.key,
            current.status
        );
        Ok(current)
    }

    fn fail(&self, expected: Status, record: &ProcessedRecord, attempts: u32, reason: &str) -> Result<ProcessedRecord> {
        error!(
            target: ALERT_TARGET,
            "{}: nonce {} failed after {} attempts: {}",
            self.name(),
            record.key,
            attempts,
            reason
        );
        self.transition(expected, record.failed(attempts, reason))
    }

    async fn prove(&self, mut record: ProcessedRecord) -> Result<ProcessedRecord> {
        let input = ProofPipeline::build_input(
            &record.event,
            self.direction.resolve_chain_ids(),
            self.direction.source_bridge(),
        );
        let mut budget = self
            .settings
            .retry
            .budget(record.attempt_count, self.settings.max_proof_attempts);
        let mut transient = self.settings.retry.backoff();
        loop {
            self.enter(Stage::Proving);
            let reason = match self.prover.prove(&input).await {
                Ok(proof) => return self.transition(Status::Pending, record.proved(proof)),
                Err(e) if e.is_transient() => {
                    self.back_off(&mut transient, &e).await;
                    continue;
                }
                Err(e) => e.to_string(),
            };
            let Some(wait) = budget.next_backoff() else {
                return self.fail(Status::Pending, &record, budget.attempts(), &reason);
            };
            warn!(
                "{}: proof attempt {}/{} for nonce {} failed: {}",
                self.name(),
                budget.attempts(),
                self.settings.max_proof_attempts,
                record.key,
                reason
            );
            record = self.transition(Status::Pending, record.attempted(budget.attempts(), &reason))?;
            if record.status != Status::Pending {
                return Ok(record);
            }
            self.enter(Stage::Backoff);
            tokio::time::sleep(wait).await;
        }
    }

    async fn already_landed(&self, record: &ProcessedRecord) -> Result<bool> {
        let submitter = &self.submitter;
        let event = &record.event;
        retry_transient(&self.settings.retry, self.name(), move || submitter.already_landed(event)).await
    }

    async fn submit(&self, record: ProcessedRecord) -> Result<ProcessedRecord> {
        let Some(proof) = record.proof.clone() else {
            warn!("{}: nonce {} has no stored proof, proving again", self.name(), record.key);
            let reprove = ProcessedRecord {
                status: Status::Pending,
                attempt_count: 0,
                ..record.clone()
            };
            return self.transition(Status::ProofOk, reprove);
        };
        let mut transient = self.settings.retry.backoff();
        loop {
            // 重新提交前必须检查目标链
            if self.already_landed(&record).await? {
                info!("{}: nonce {} already landed on {}", self.name(), record.key, self.direction.destination_ledger());
                return self.transition(Status::ProofOk, record.confirmed());
            }
            self.enter(Stage::Submitting);
            match self.submitter.submit(&record.event, &proof).await {
                Ok(tx_id) => return self.transition(Status::ProofOk, record.submitted(tx_id)),
                Err(e) if e.is_transient() => self.back_off(&mut transient, &e).await,
                Err(Error::Submission(reason)) if is_already_processed(&reason) => {
                    info!("{}: nonce {} already processed: {}", self.name(), record.key, reason);
                    return self.transition(Status::ProofOk, record.confirmed());
                }
                Err(e @ Error::Encode(_)) => {
                    return self.fail(Status::ProofOk, &record, record.attempt_count, &e.to_string());
                }
                Err(e) => return self.rejected(Status::ProofOk, record, &e.to_string()).await,
            }
        }
    }

    /// A logical rejection: consumes one submission attempt.
    async fn rejected(&self, expected: Status, record: ProcessedRecord, reason: &str) -> Result<ProcessedRecord> {
        let mut budget = self
            .settings
            .retry
            .budget(record.attempt_count, self.settings.max_submit_attempts);
        let Some(wait) = budget.next_backoff() else {
            return self.fail(expected, &record, budget.attempts(), reason);
        };
        warn!(
            "{}: submission {}/{} for nonce {} rejected: {}",
            self.name(),
            budget.attempts(),
            self.settings.max_submit_attempts,
            record.key,
            reason
        );
        let next = self.transition(expected, record.resubmit(budget.attempts(), reason))?;
        self.enter(Stage::Backoff);
        tokio::time::sleep(wait).await;
        Ok(next)
    }

    async fn confirm(&self, record: ProcessedRecord, timeouts: &mut impl Backoff) -> Result<ProcessedRecord> {
        let Some(tx_id) = record.tx_id.clone() else {
            return self.transition(
                Status::Submitted,
                record.resubmit(record.attempt_count, "missing transaction id"),
            );
        };
        let mut transient = self.settings.retry.backoff();
        loop {
            self.enter(Stage::Confirming);
            match self.submitter.confirm(&tx_id).await {
                Ok(Confirmation::Confirmed(receipt)) => {
                    info!(
                        "{}: nonce {} confirmed in {} at {}",
                        self.name(),
                        record.key,
                        receipt.tx_id,
                        receipt.height
                    );
                    return self.transition(Status::Submitted, record.confirmed());
                }
                Ok(Confirmation::Rejected(reason)) => {
                    if is_already_processed(&reason) || self.already_landed(&record).await? {
                        return self.transition(Status::Submitted, record.confirmed());
                    }
                    return self.rejected(Status::Submitted, record, &reason).await;
                }
                Ok(Confirmation::NotLanded) => {
                    if self.already_landed(&record).await? {
                        return self.transition(Status::Submitted, record.confirmed());
                    }
                    // 超时不消耗提交次数，但重新提交前要退避
                    let next = self.transition(
                        Status::Submitted,
                        record.resubmit(record.attempt_count, "inclusion timeout"),
                    )?;
                    if next.status == Status::ProofOk {
                        let reason = format!("{} not included in time for nonce {}", tx_id, next.key);
                        self.back_off(timeouts, reason).await;
                    }
                    return Ok(next);
                }
                Err(e) if e.is_transient() => self.back_off(&mut transient, &e).await,
                Err(e) => return self.rejected(Status::Submitted, record, &e.to_string()).await,
            }
        }
    }
}

/// Wires configured ledgers, signers and the prover into direction loops.
pub struct Relayer {
    config: Config,
    store: Arc<SledStore>,
}

impl Relayer {
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(SledStore::open(&config.store.path)?);
        Ok(Self { config, store })
    }

    pub fn store(&self) -> Arc<SledStore> {
        self.store.clone()
    }

    fn signer(&self, ledger: Ledger, evm: &EvmAdapter) -> Result<Arc<dyn Signer>> {
        let config = self
            .config
            .signers
            .for_ledger(ledger)
            .ok_or_else(|| Error::Config(format!("No {} signer configured", ledger)))?;
        match (config, ledger) {
            (SignerConfig::Command { program, args, timeout_secs }, _) => Ok(Arc::new(CommandSigner::new(
                program,
                args.iter().map(OsString::from).collect(),
                Duration::from_secs(*timeout_secs),
            ))),
            (SignerConfig::PrivateKey { .. }, Ledger::Evm) => {
                let key = config.private_key()?.unwrap_or_default();
                let bridge = EthAddress::from(self.config.evm_bridge()?.0);
                Ok(Arc::new(EvmWalletSigner::new(
                    &key,
                    self.config.evm.chain_id as u64,
                    evm.provider().clone(),
                    bridge,
                )?))
            }
            (SignerConfig::PrivateKey { .. }, Ledger::Ton) => Err(Error::Config(
                "TON signing must be delegated to a command signer".to_string(),
            )),
        }
    }

    async fn ensure_deployed(&self, reader: &dyn LedgerReadPort, address: &str) -> Result<()> {
        let policy = self.config.relayer.retry_policy();
        let deployed = retry_transient(&policy, "deployment check", move || reader.is_deployed(address)).await?;
        if !deployed {
            return Err(Error::Config(format!(
                "{} bridge {} is not deployed",
                reader.ledger(),
                address
            )));
        }
        Ok(())
    }

    /// Builds one orchestrator per enabled direction. Refuses to start when
    /// a bridge account is not deployed.
    pub async fn orchestrators(&self) -> Result<Vec<DirectionOrchestrator>> {
        let ton_bridge = self.config.ton_bridge()?;
        let evm_bridge = self.config.evm_bridge()?;
        let ton = Arc::new(TonAdapter::new(
            &self.config.ton.api_url,
            self.config.ton.api_key.clone(),
            ton_bridge,
            &self.config.ton.processed_method,
        ));
        let evm = Arc::new(EvmAdapter::new(
            &self.config.evm.rpc_url,
            &self.config.evm.bridge_address,
            self.config.evm.confirmations,
            self.config.evm.max_block_range,
        )?);
        self.ensure_deployed(ton.as_ref(), &ton_bridge.to_string()).await?;
        self.ensure_deployed(evm.as_ref(), &evm_bridge.to_string()).await?;

        let prover_config = &self.config.prover;
        let backend = SnarkjsBackend::new(
            &prover_config.snarkjs_bin,
            prover_config.snarkjs_args.iter().map(OsString::from).collect(),
            &prover_config.wasm_file,
            &prover_config.zkey_file,
            prover_config.timeout(),
        );
        let prover = Arc::new(ProofPipeline::new(
            Arc::new(backend),
            VerificationKey::load(&prover_config.verification_key)?,
        ));

        let mut orchestrators = Vec::new();
        for name in &self.config.directions {
            let chains = self.config.chain_pair(name)?;
            let (direction, writer): (Arc<dyn Direction>, Arc<dyn LedgerWritePort>) = match name.as_str() {
                EvmToTon::NAME => (
                    Arc::new(EvmToTon::new(evm.clone(), Address::Evm(evm_bridge), chains)),
                    ton.clone() as Arc<dyn LedgerWritePort>,
                ),
                TonToEvm::NAME => (
                    Arc::new(TonToEvm::new(ton.clone(), Address::Ton(ton_bridge), chains)),
                    evm.clone() as Arc<dyn LedgerWritePort>,
                ),
                other => return Err(Error::Config(format!("Unknown direction: {}", other))),
            };
            let signer = self.signer(direction.destination_ledger(), &evm)?;
            let submitter = OutboundSubmitter::new(
                direction.clone(),
                signer,
                writer,
                self.config.relayer.inclusion_timeout(),
            );
            orchestrators.push(DirectionOrchestrator::new(
                direction,
                self.store.clone(),
                prover.clone(),
                submitter,
                OrchestratorSettings::from_config(&self.config, name),
            ));
        }
        Ok(orchestrators)
    }

    /// Runs every enabled direction until `cancel` fires or one of them hits
    /// a fatal error, which stops the others too.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        info!("Starting relayer...");
        let orchestrators = self.orchestrators().await?;
        let cancel = cancel.child_token();

        let handles: Vec<_> = orchestrators
            .into_iter()
            .map(|orchestrator| {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let result = orchestrator.run(cancel.clone()).await;
                    if result.is_err() {
                        cancel.cancel();
                    }
                    result
                })
            })
            .collect();

        let mut first_error = None;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => error!("direction task ended abnormally: {}", e),
            }
        }
        self.store.flush()?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::{LedgerPage, MockLedgerReadPort, MockLedgerWritePort, MockSigner};
    use crate::codec::{self, OP_EVM_DEPOSIT, OP_TON_DEPOSIT};
    use crate::prover::MockProvingBackend;
    use crate::store::tests::event;
    use crate::store::{IdempotencyStore, CursorStore, InMemoryStore};
    use crate::types::{ChainPair, Groth16Proof, Inclusion, Proof, RawMessage, Receipt, TxId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TON_BRIDGE: &str = "EQCFX97P86v7GNUVgwlrf-G6qNBiQo68GpeK05E-i3zeZcni";
    const CHAINS: ChainPair = ChainPair {
        source: 607,
        destination: 1,
    };

    fn proof() -> Proof {
        Proof {
            proof: Groth16Proof {
                pi_a: vec!["1".into(), "2".into(), "1".into()],
                pi_b: vec![
                    vec!["3".into(), "4".into()],
                    vec!["5".into(), "6".into()],
                    vec!["1".into(), "0".into()],
                ],
                pi_c: vec!["7".into(), "8".into(), "1".into()],
            },
            public_signals: vec!["9".into()],
        }
    }

    fn message(height: u64, bodies: Vec<Vec<u8>>) -> RawMessage {
        RawMessage {
            tx_id: format!("tx{}", height),
            timestamp: 1_700_000_000 + height,
            cursor: Cursor::at_height(height),
            bodies,
        }
    }

    fn deposit(nonce: u64) -> Vec<u8> {
        codec::encode(&event(nonce)).unwrap()
    }

    fn key(nonce: u64) -> NonceKey {
        NonceKey::new(CHAINS.source, OP_TON_DEPOSIT, nonce)
    }

    fn reader(messages: Vec<RawMessage>) -> MockLedgerReadPort {
        let mut reader = MockLedgerReadPort::new();
        reader.expect_get_transactions().returning(move |_, _, _| {
            Ok(LedgerPage {
                messages: messages.clone(),
                scanned_to: None,
                has_more: false,
            })
        });
        reader
    }

    fn working_prover(calls: usize) -> MockProvingBackend {
        let mut backend = MockProvingBackend::new();
        backend.expect_full_prove().times(calls).returning(|_| Ok(proof()));
        backend.expect_verify().times(calls).returning(|_, _| Ok(true));
        backend
    }

    fn included() -> MockLedgerWritePort {
        let mut writer = MockLedgerWritePort::new();
        writer.expect_await_inclusion().returning(|tx, _| {
            Ok(Inclusion::Included(Receipt {
                tx_id: tx.clone(),
                success: true,
                height: 100,
                reason: None,
            }))
        });
        writer
    }

    fn passthrough_signer() -> MockSigner {
        let mut signer = MockSigner::new();
        signer.expect_sign().returning(|payload| Ok(payload.to_vec()));
        signer
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            page_size: 10,
            max_proof_attempts: 3,
            max_submit_attempts: 3,
            poll_interval: Duration::from_millis(1),
            retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2)),
            start_cursor: Cursor::ZERO,
        }
    }

    fn orchestrator(
        reader: MockLedgerReadPort,
        backend: MockProvingBackend,
        signer: MockSigner,
        writer: MockLedgerWritePort,
        store: Arc<InMemoryStore>,
    ) -> DirectionOrchestrator {
        let direction = Arc::new(TonToEvm::new(
            Arc::new(reader),
            TON_BRIDGE.parse().unwrap(),
            CHAINS,
        ));
        assemble(direction, backend, signer, writer, store, settings())
    }

    fn assemble(
        direction: Arc<dyn Direction>,
        backend: MockProvingBackend,
        signer: MockSigner,
        writer: MockLedgerWritePort,
        store: Arc<InMemoryStore>,
        settings: OrchestratorSettings,
    ) -> DirectionOrchestrator {
        let submitter = OutboundSubmitter::new(
            direction.clone(),
            Arc::new(signer),
            Arc::new(writer),
            Duration::from_millis(10),
        );
        let prover = Arc::new(ProofPipeline::new(
            Arc::new(backend),
            VerificationKey(serde_json::json!({})),
        ));
        DirectionOrchestrator::new(direction, store, prover, submitter, settings)
    }

    fn landing_writer(submits: usize) -> MockLedgerWritePort {
        let mut writer = included();
        writer.expect_effect_exists().returning(|_| Ok(false));
        writer
            .expect_submit()
            .times(submits)
            .returning(|_| Ok(TxId("0xfeed".into())));
        writer
    }

    fn evm_deposit(nonce: u64) -> Vec<u8> {
        codec::encode(&DecodedEvent {
            opcode: OP_EVM_DEPOSIT,
            nonce,
            amount: 500,
            source_address: "0x00000000000000000000000000000000000000ff".parse().unwrap(),
            destination_address: TON_BRIDGE.parse().unwrap(),
            source_chain_id: None,
            destination_chain_id: None,
        })
        .unwrap()
    }

    /// Serves `messages` once, then cancels `stop` on the next read.
    fn reader_then_cancel(messages: Vec<RawMessage>, stop: CancellationToken) -> MockLedgerReadPort {
        let mut reader = MockLedgerReadPort::new();
        let calls = AtomicUsize::new(0);
        reader.expect_get_transactions().returning(move |_, _, _| {
            if calls.fetch_add(1, Ordering::SeqCst) > 0 {
                stop.cancel();
            }
            Ok(LedgerPage {
                messages: messages.clone(),
                scanned_to: None,
                has_more: false,
            })
        });
        reader
    }

    #[tokio::test]
    async fn same_deposit_twice_is_relayed_once() {
        let store = Arc::new(InMemoryStore::new());
        let mut writer = included();
        writer.expect_effect_exists().times(1).returning(|_| Ok(false));
        writer.expect_submit().times(1).returning(|_| Ok(TxId("0xfeed".into())));
        let mut relay = orchestrator(
            reader(vec![message(10, vec![deposit(1)]), message(11, vec![deposit(1)])]),
            working_prover(1),
            passthrough_signer(),
            writer,
            store.clone(),
        );

        assert!(!relay.tick().await.unwrap());
        // The adapter keeps returning the same page; nothing is handled twice.
        assert!(!relay.tick().await.unwrap());

        let records = store.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Confirmed);
        assert_eq!(records[0].tx_id, Some(TxId("0xfeed".into())));
        assert_eq!(store.load_cursor(TonToEvm::NAME).unwrap(), Some(Cursor::at_height(11)));
        assert_eq!(relay.stage(), Stage::AdvanceCursor);
    }

    #[tokio::test]
    async fn truncated_body_is_skipped_and_the_loop_continues() {
        let store = Arc::new(InMemoryStore::new());
        let mut writer = included();
        writer.expect_effect_exists().returning(|_| Ok(false));
        writer.expect_submit().times(1).returning(|_| Ok(TxId("0x01".into())));
        let mut relay = orchestrator(
            reader(vec![
                message(5, vec![vec![0x73, 0x62, 0xd0, 0x9c]]),
                message(6, vec![deposit(2)]),
            ]),
            working_prover(1),
            passthrough_signer(),
            writer,
            store.clone(),
        );

        relay.tick().await.unwrap();

        assert_eq!(store.records().unwrap().len(), 1);
        assert_eq!(store.get(&key(2)).unwrap().unwrap().status, Status::Confirmed);
        assert_eq!(store.load_cursor(TonToEvm::NAME).unwrap(), Some(Cursor::at_height(6)));
    }

    #[tokio::test]
    async fn failing_prover_is_bounded_and_never_submits() {
        let store = Arc::new(InMemoryStore::new());
        let mut backend = MockProvingBackend::new();
        backend
            .expect_full_prove()
            .times(3)
            .returning(|_| Err(Error::Proof("constraint not satisfied".into())));
        backend.expect_verify().times(0);
        let mut signer = MockSigner::new();
        signer.expect_sign().times(0);
        let mut writer = MockLedgerWritePort::new();
        writer.expect_submit().times(0);
        let mut relay = orchestrator(reader(vec![message(7, vec![deposit(3)])]), backend, signer, writer, store.clone());

        relay.tick().await.unwrap();

        let record = store.get(&key(3)).unwrap().unwrap();
        assert_eq!(record.status, Status::Failed);
        assert_eq!(record.attempt_count, 3);
        assert!(record.last_error.unwrap().contains("constraint"));
        // Terminal failure still lets the cursor pass the transaction.
        assert_eq!(store.load_cursor(TonToEvm::NAME).unwrap(), Some(Cursor::at_height(7)));
    }

    #[tokio::test]
    async fn backend_outage_does_not_consume_proof_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut backend = MockProvingBackend::new();
        backend.expect_full_prove().returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 5 {
                Err(Error::Network("snarkjs not reachable".into()))
            } else {
                Ok(proof())
            }
        });
        backend.expect_verify().returning(|_, _| Ok(true));
        let mut writer = included();
        writer.expect_effect_exists().returning(|_| Ok(false));
        writer.expect_submit().times(1).returning(|_| Ok(TxId("0x02".into())));
        let mut relay = orchestrator(
            reader(vec![message(8, vec![deposit(4)])]),
            backend,
            passthrough_signer(),
            writer,
            store.clone(),
        );

        relay.tick().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(store.get(&key(4)).unwrap().unwrap().status, Status::Confirmed);
    }

    #[tokio::test]
    async fn landed_submission_is_confirmed_without_resubmitting() {
        let store = Arc::new(InMemoryStore::new());
        let submitted = ProcessedRecord::pending(key(5), event(5))
            .proved(proof())
            .submitted(TxId("0xlost".into()));
        assert!(store.create_if_absent(&submitted).unwrap().is_none());

        let mut writer = MockLedgerWritePort::new();
        writer.expect_await_inclusion().returning(|_, _| Ok(Inclusion::Timeout));
        writer.expect_effect_exists().returning(|_| Ok(true));
        writer.expect_submit().times(0);
        let mut signer = MockSigner::new();
        signer.expect_sign().times(0);
        let mut relay = orchestrator(
            reader(vec![message(9, vec![deposit(5)])]),
            working_prover(0),
            signer,
            writer,
            store.clone(),
        );

        relay.tick().await.unwrap();

        assert_eq!(store.get(&key(5)).unwrap().unwrap().status, Status::Confirmed);
    }

    #[tokio::test]
    async fn rejections_consume_submission_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let mut writer = MockLedgerWritePort::new();
        writer.expect_effect_exists().returning(|_| Ok(false));
        writer
            .expect_submit()
            .times(3)
            .returning(|_| Err(Error::Submission("execution reverted: bad proof".into())));
        let mut relay = orchestrator(
            reader(vec![message(12, vec![deposit(6)])]),
            working_prover(1),
            passthrough_signer(),
            writer,
            store.clone(),
        );

        relay.tick().await.unwrap();

        let record = store.get(&key(6)).unwrap().unwrap();
        assert_eq!(record.status, Status::Failed);
        assert_eq!(record.attempt_count, 3);
        assert!(record.proof.is_some());
    }

    #[tokio::test]
    async fn already_processed_rejection_counts_as_confirmed() {
        let store = Arc::new(InMemoryStore::new());
        let mut writer = MockLedgerWritePort::new();
        writer.expect_effect_exists().returning(|_| Ok(false));
        writer
            .expect_submit()
            .times(1)
            .returning(|_| Err(Error::Submission("execution reverted: nonce already processed".into())));
        let mut relay = orchestrator(
            reader(vec![message(13, vec![deposit(7)])]),
            working_prover(1),
            passthrough_signer(),
            writer,
            store.clone(),
        );

        relay.tick().await.unwrap();

        assert_eq!(store.get(&key(7)).unwrap().unwrap().status, Status::Confirmed);
    }

    #[tokio::test]
    async fn inclusion_timeout_resubmits_without_consuming_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let delay = Duration::from_millis(80);
        let waits = Arc::new(AtomicUsize::new(0));
        let seen = waits.clone();
        let mut writer = MockLedgerWritePort::new();
        writer.expect_effect_exists().returning(|_| Ok(false));
        writer.expect_submit().times(2).returning(|_| Ok(TxId("0x03".into())));
        writer.expect_await_inclusion().returning(move |tx, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Inclusion::Timeout)
            } else {
                Ok(Inclusion::Included(Receipt {
                    tx_id: tx.clone(),
                    success: true,
                    height: 1,
                    reason: None,
                }))
            }
        });
        let direction = Arc::new(TonToEvm::new(
            Arc::new(reader(vec![message(14, vec![deposit(8)])])),
            TON_BRIDGE.parse().unwrap(),
            CHAINS,
        ));
        let mut relay = assemble(
            direction,
            working_prover(1),
            passthrough_signer(),
            writer,
            store.clone(),
            OrchestratorSettings {
                retry: RetryPolicy::new(delay, delay * 4),
                ..settings()
            },
        );

        let started = std::time::Instant::now();
        relay.tick().await.unwrap();
        // The second submission waited out at least the randomized first
        // backoff interval.
        assert!(started.elapsed() >= delay / 2, "resubmitted after {:?}", started.elapsed());

        let record = store.get(&key(8)).unwrap().unwrap();
        assert_eq!(record.status, Status::Confirmed);
        assert_eq!(record.attempt_count, 0);
    }

    #[tokio::test]
    async fn read_errors_are_retried_at_the_same_cursor() {
        let store = Arc::new(InMemoryStore::new());
        store.save_cursor(TonToEvm::NAME, Cursor::at_height(20)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut reader = MockLedgerReadPort::new();
        reader.expect_get_transactions().returning(move |_, since, _| {
            assert_eq!(since, Cursor::at_height(20));
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Network("connection reset".into()))
            } else {
                Ok(LedgerPage {
                    messages: vec![],
                    scanned_to: Some(Cursor::at_height(25)),
                    has_more: true,
                })
            }
        });
        let mut relay = orchestrator(
            reader,
            working_prover(0),
            MockSigner::new(),
            MockLedgerWritePort::new(),
            store.clone(),
        );

        assert!(relay.tick().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.load_cursor(TonToEvm::NAME).unwrap(), Some(Cursor::at_height(25)));
    }

    #[tokio::test]
    async fn cancelled_before_start_reads_nothing() {
        let mut reader = MockLedgerReadPort::new();
        reader.expect_get_transactions().times(0);
        let relay = orchestrator(
            reader,
            working_prover(0),
            MockSigner::new(),
            MockLedgerWritePort::new(),
            Arc::new(InMemoryStore::new()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        relay.run(cancel).await.unwrap();
    }

    #[tokio::test]
    async fn run_drains_paged_history_before_idling() {
        let store = Arc::new(InMemoryStore::new());
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut reader = MockLedgerReadPort::new();
        reader.expect_get_transactions().returning(move |_, since, _| {
            match seen.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(LedgerPage {
                    messages: vec![message(10, vec![deposit(1)])],
                    scanned_to: None,
                    has_more: true,
                }),
                1 => {
                    assert_eq!(since, Cursor::at_height(10));
                    stop.cancel();
                    Ok(LedgerPage {
                        messages: vec![message(11, vec![deposit(2)])],
                        scanned_to: None,
                        has_more: false,
                    })
                }
                n => panic!("read {} should never happen", n),
            }
        });
        let direction = Arc::new(TonToEvm::new(Arc::new(reader), TON_BRIDGE.parse().unwrap(), CHAINS));
        let relay = assemble(
            direction,
            working_prover(2),
            passthrough_signer(),
            landing_writer(2),
            store.clone(),
            OrchestratorSettings {
                poll_interval: Duration::from_secs(3600),
                ..settings()
            },
        );

        // The second page is read without waiting out the poll interval.
        tokio::time::timeout(Duration::from_secs(5), relay.run(cancel))
            .await
            .expect("second page read before idling")
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get(&key(1)).unwrap().unwrap().status, Status::Confirmed);
        assert_eq!(store.get(&key(2)).unwrap().unwrap().status, Status::Confirmed);
        assert_eq!(store.load_cursor(TonToEvm::NAME).unwrap(), Some(Cursor::at_height(11)));
    }

    #[tokio::test]
    async fn both_directions_share_one_store() {
        let store = Arc::new(InMemoryStore::new());
        let evm_chains = ChainPair {
            source: CHAINS.destination,
            destination: CHAINS.source,
        };

        let ton_cancel = CancellationToken::new();
        let ton_to_evm = orchestrator(
            reader_then_cancel(vec![message(10, vec![deposit(1)])], ton_cancel.clone()),
            working_prover(1),
            passthrough_signer(),
            landing_writer(1),
            store.clone(),
        );

        let evm_cancel = CancellationToken::new();
        let evm_to_ton = assemble(
            Arc::new(EvmToTon::new(
                Arc::new(reader_then_cancel(
                    vec![message(30, vec![evm_deposit(1)])],
                    evm_cancel.clone(),
                )),
                "0x00000000000000000000000000000000000000b1".parse().unwrap(),
                evm_chains,
            )),
            working_prover(1),
            passthrough_signer(),
            landing_writer(1),
            store.clone(),
            settings(),
        );

        let (a, b) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(ton_to_evm.run(ton_cancel), evm_to_ton.run(evm_cancel)) },
        )
        .await
        .unwrap();
        a.unwrap();
        b.unwrap();

        // Same nonce on both sides, two distinct records.
        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == Status::Confirmed));
        assert!(store
            .get(&NonceKey::new(evm_chains.source, OP_EVM_DEPOSIT, 1))
            .unwrap()
            .is_some());
        assert_eq!(store.load_cursor(TonToEvm::NAME).unwrap(), Some(Cursor::at_height(10)));
        assert_eq!(store.load_cursor(EvmToTon::NAME).unwrap(), Some(Cursor::at_height(30)));
    }
}
