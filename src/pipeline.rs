//! Pipeline Module
//!
//! Turns creation events into [`MintRecord`]s without blocking the receive loop.
//!
//! Each event gets a sequence number at detection time. Secondary fetches run as
//! spawned tasks bounded by a semaphore and report back over an `mpsc` channel;
//! the [`ReorderBuffer`] releases outcomes strictly in sequence order, so records
//! reach the store in detection order whatever order the fetches finish in.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::IngestorConfig;
use crate::decoder::decode_instruction;
use crate::fetch::{resolve_instruction, FetchError, FetchedTransaction, TransactionFetcher};
use crate::router::AccountPayload;
use crate::schema::{InstructionSchema, SchemaRegistry};
use crate::store::{current_timestamp_secs, MintRecord};

/// Buffered fetch results before tasks wait on the channel
pub const RESULT_CHANNEL_CAPACITY: usize = 256;

/// Result of processing one creation event
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Record(MintRecord),
    /// The event could not be turned into a record; logged and skipped
    SoftFailure { reference: String, reason: String },
}

impl Outcome {
    pub fn soft(reference: impl Into<String>, reason: impl ToString) -> Self {
        Outcome::SoftFailure {
            reference: reference.into(),
            reason: reason.to_string(),
        }
    }

    /// Transaction or account reference the outcome belongs to
    pub fn reference(&self) -> &str {
        match self {
            Outcome::Record(record) => &record.transaction_url,
            Outcome::SoftFailure { reference, .. } => reference,
        }
    }
}

/// Releases items in sequence order
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(next: u64) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
        }
    }

    /// Buffer an item; stale or repeated sequence numbers are rejected
    pub fn insert(&mut self, seq: u64, item: T) -> bool {
        if seq < self.next || self.pending.contains_key(&seq) {
            return false;
        }
        self.pending.insert(seq, item);
        true
    }

    /// Remove and return the contiguous run starting at the next expected sequence
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    pub fn next_expected(&self) -> u64 {
        self.next
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Retry policy for transactions not yet visible to the HTTP endpoint
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl FetchPolicy {
    pub fn from_config(config: &IngestorConfig) -> Self {
        Self {
            attempts: config.fetch_attempts.max(1),
            retry_delay: Duration::from_millis(config.fetch_retry_delay_ms),
        }
    }
}

/// Fetch a transaction, retrying while the node does not have it or errors
pub async fn fetch_with_retry(
    fetcher: &dyn TransactionFetcher,
    signature: &str,
    policy: &FetchPolicy,
) -> Result<Option<FetchedTransaction>, FetchError> {
    let attempts = policy.attempts.max(1);
    let mut last = Ok(None);
    for attempt in 1..=attempts {
        last = fetcher.fetch(signature).await;
        match &last {
            Ok(Some(_)) => return last,
            Ok(None) => debug!("Transaction {} not available yet (attempt {}/{})", signature, attempt, attempts),
            Err(e) => debug!("Fetch of {} failed (attempt {}/{}): {}", signature, attempt, attempts, e),
        }
        if attempt < attempts {
            sleep(policy.retry_delay).await;
        }
    }
    last
}

/// Resolve a log-detected creation event into a record
///
/// Never panics on bad input; every failure becomes [`Outcome::SoftFailure`].
pub async fn resolve_creation(
    fetcher: &dyn TransactionFetcher,
    schema: &InstructionSchema,
    program_id: &str,
    signature: &str,
    reference: &str,
    policy: &FetchPolicy,
) -> Outcome {
    let tx = match fetch_with_retry(fetcher, signature, policy).await {
        Ok(Some(tx)) => tx,
        Ok(None) => {
            return Outcome::soft(
                reference,
                format!("transaction not available after {} attempts", policy.attempts.max(1)),
            )
        }
        Err(e) => return Outcome::soft(reference, e),
    };

    if !tx.succeeded() {
        return Outcome::soft(reference, "transaction failed");
    }

    let resolved = match resolve_instruction(&tx, program_id, schema) {
        Ok(resolved) => resolved,
        Err(e) => return Outcome::soft(reference, e),
    };

    match decode_instruction(&resolved.data, schema, &resolved.accounts) {
        Ok(decoded) => Outcome::Record(MintRecord::from_decoded(reference, &decoded)),
        Err(e) => Outcome::soft(reference, e),
    }
}

/// Decode an account notification's embedded payload
///
/// The only known address is the notified account itself, so bindings past
/// index 0 are dropped. Returns `None` when no schema matches the data.
pub fn decode_account(registry: &SchemaRegistry, payload: &AccountPayload, reference: &str) -> Option<Outcome> {
    let schema = registry.identify(&payload.data)?;
    let accounts: Vec<String> = payload.pubkey.iter().cloned().collect();
    let schema = schema.bound_within(accounts.len());

    Some(match decode_instruction(&payload.data, &schema, &accounts) {
        Ok(decoded) => Outcome::Record(MintRecord::from_decoded(reference, &decoded)),
        Err(e) => Outcome::soft(reference, e),
    })
}

/// Offloaded work plus the reorder buffer that serializes its results
pub struct Pipeline {
    fetcher: Arc<dyn TransactionFetcher>,
    schema: Arc<InstructionSchema>,
    program_id: Arc<str>,
    policy: FetchPolicy,
    semaphore: Arc<Semaphore>,
    results_tx: mpsc::Sender<(u64, Outcome)>,
    results_rx: mpsc::Receiver<(u64, Outcome)>,
    tasks: HashMap<u64, JoinHandle<()>>,
    references: HashSet<String>,
    reorder: ReorderBuffer<Outcome>,
    next_seq: u64,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn TransactionFetcher>,
        schema: InstructionSchema,
        program_id: impl Into<String>,
        policy: FetchPolicy,
        max_in_flight: usize,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let program_id: String = program_id.into();
        Self {
            fetcher,
            schema: Arc::new(schema),
            program_id: Arc::from(program_id),
            policy,
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            results_tx,
            results_rx,
            tasks: HashMap::new(),
            references: HashSet::new(),
            reorder: ReorderBuffer::new(),
            next_seq: 0,
        }
    }

    /// Whether an outcome for `reference` is still pending
    pub fn is_in_flight(&self, reference: &str) -> bool {
        self.references.contains(reference)
    }

    /// Number of spawned fetches that have not reported back
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    fn next_seq(&mut self, reference: &str) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.references.insert(reference.to_string());
        seq
    }

    /// Start resolving a log-detected creation event in the background
    ///
    /// The record is stamped with the time of this call, not of the fetch.
    pub fn dispatch_fetch(&mut self, signature: String, reference: String) -> u64 {
        let seq = self.next_seq(&reference);
        let detected_at = current_timestamp_secs();
        let fetcher = Arc::clone(&self.fetcher);
        let schema = Arc::clone(&self.schema);
        let program_id = Arc::clone(&self.program_id);
        let policy = self.policy.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let results = self.results_tx.clone();

        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let work = resolve_creation(&*fetcher, &schema, &program_id, &signature, &reference, &policy);
            let result = AssertUnwindSafe(work).catch_unwind().await;
            let mut outcome =
                result.unwrap_or_else(|_| Outcome::soft(reference, "fetch task panicked"));
            if let Outcome::Record(record) = &mut outcome {
                record.timestamp = detected_at;
            }
            // Receiver gone means the session has shut down
            let _ = results.send((seq, outcome)).await;
        });
        self.tasks.insert(seq, handle);
        seq
    }

    /// Queue an outcome that was produced inline; returns whatever became ready
    pub fn submit(&mut self, outcome: Outcome) -> Vec<Outcome> {
        let seq = self.next_seq(outcome.reference());
        self.accept(seq, outcome)
    }

    /// Next fetch result; cancel safe
    pub async fn next_result(&mut self) -> Option<(u64, Outcome)> {
        self.results_rx.recv().await
    }

    /// Record a finished outcome and release the contiguous run it completes
    pub fn accept(&mut self, seq: u64, outcome: Outcome) -> Vec<Outcome> {
        self.tasks.remove(&seq);
        if !self.reorder.insert(seq, outcome) {
            warn!("Ignoring repeated result for sequence {}", seq);
        }
        let ready = self.reorder.drain_ready();
        for outcome in &ready {
            self.references.remove(outcome.reference());
        }
        ready
    }

    /// Abort outstanding fetches and release what already completed in order
    ///
    /// Results stuck behind an aborted fetch are discarded.
    pub fn shutdown(&mut self) -> Vec<Outcome> {
        let aborted = self.tasks.len();
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }

        let mut ready = Vec::new();
        while let Ok((seq, outcome)) = self.results_rx.try_recv() {
            ready.extend(self.accept(seq, outcome));
        }

        let discarded = self.reorder.pending_len();
        if aborted > 0 || discarded > 0 {
            warn!(
                "Shutdown aborted {} in-flight fetches and discarded {} buffered results",
                aborted, discarded
            );
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{encode_payload, PayloadEncoding};
    use crate::fetch::MockTransactionFetcher;
    use crate::schema::{pump_create_schema, PUMP_PROGRAM_ID};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn create_data(name: &str) -> Vec<u8> {
        let mut data = pump_create_schema().discriminator;
        for s in [name, "SYM", "https://example.com/meta.json"] {
            data.extend_from_slice(&(s.len() as u32).to_le_bytes());
            data.extend_from_slice(s.as_bytes());
        }
        data
    }

    fn transaction(data: &[u8], err: Option<serde_json::Value>) -> FetchedTransaction {
        serde_json::from_value(json!({
            "slot": 1,
            "transaction": {
                "signatures": ["sig"],
                "message": {
                    "accountKeys": ["Mint", "Auth", "Curve", "Assoc", "Global", "Mpl", "Meta", "User", PUMP_PROGRAM_ID],
                    "instructions": [{
                        "programIdIndex": 8,
                        "accounts": [0, 1, 2, 3, 4, 5, 6, 7],
                        "data": encode_payload(data, PayloadEncoding::Base58)
                    }]
                }
            },
            "meta": {"err": err, "logMessages": ["Program log: Create"]}
        }))
        .unwrap()
    }

    fn fast_policy(attempts: u32) -> FetchPolicy {
        FetchPolicy {
            attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    // ==================== ReorderBuffer tests ====================

    #[test]
    fn test_reorder_buffer_in_order() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.insert(0, "a"));
        assert_eq!(buffer.drain_ready(), vec!["a"]);
        assert!(buffer.insert(1, "b"));
        assert_eq!(buffer.drain_ready(), vec!["b"]);
        assert_eq!(buffer.next_expected(), 2);
    }

    #[test]
    fn test_reorder_buffer_holds_until_gap_fills() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(2, "c");
        buffer.insert(1, "b");
        assert!(buffer.drain_ready().is_empty());
        assert_eq!(buffer.pending_len(), 2);

        buffer.insert(0, "a");
        assert_eq!(buffer.drain_ready(), vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_reorder_buffer_rejects_stale_and_repeated() {
        let mut buffer = ReorderBuffer::starting_at(5);
        assert!(!buffer.insert(4, "old"));
        assert!(buffer.insert(6, "x"));
        assert!(!buffer.insert(6, "y"));
        buffer.insert(5, "w");
        assert_eq!(buffer.drain_ready(), vec!["w", "x"]);
    }

    // ==================== resolve_creation tests ====================

    #[tokio::test]
    async fn test_resolve_creation_builds_record() {
        let data = create_data("Test Token");
        let mut fetcher = MockTransactionFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|sig| sig == "sig1")
            .times(1)
            .returning(move |_| Ok(Some(transaction(&data, None))));

        let outcome = resolve_creation(
            &fetcher,
            &pump_create_schema(),
            PUMP_PROGRAM_ID,
            "sig1",
            "ref1",
            &fast_policy(3),
        )
        .await;

        match outcome {
            Outcome::Record(record) => {
                assert_eq!(record.transaction_url, "ref1");
                assert_eq!(record.mint_address.as_deref(), Some("Mint"));
                assert_eq!(record.name.as_deref(), Some("Test Token"));
                assert_eq!(record.symbol.as_deref(), Some("SYM"));
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_creation_retries_until_visible() {
        let data = create_data("Late");
        let mut fetcher = MockTransactionFetcher::new();
        let mut seq = mockall::Sequence::new();
        fetcher
            .expect_fetch()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        fetcher
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(Some(transaction(&data, None))));

        let outcome = resolve_creation(&fetcher, &pump_create_schema(), PUMP_PROGRAM_ID, "s", "r", &fast_policy(3)).await;
        assert!(matches!(outcome, Outcome::Record(_)));
    }

    #[tokio::test]
    async fn test_resolve_creation_never_visible_is_soft_failure() {
        let mut fetcher = MockTransactionFetcher::new();
        fetcher.expect_fetch().times(2).returning(|_| Ok(None));

        let outcome = resolve_creation(&fetcher, &pump_create_schema(), PUMP_PROGRAM_ID, "s", "r", &fast_policy(2)).await;
        assert!(matches!(outcome, Outcome::SoftFailure { ref reason, .. } if reason.contains("2 attempts")));
    }

    #[tokio::test]
    async fn test_resolve_creation_failed_transaction() {
        let data = create_data("Failed");
        let mut fetcher = MockTransactionFetcher::new();
        fetcher
            .expect_fetch()
            .returning(move |_| Ok(Some(transaction(&data, Some(json!({"InstructionError": [0, "Custom"]}))))));

        let outcome = resolve_creation(&fetcher, &pump_create_schema(), PUMP_PROGRAM_ID, "s", "r", &fast_policy(1)).await;
        assert_eq!(outcome, Outcome::soft("r", "transaction failed"));
    }

    #[tokio::test]
    async fn test_resolve_creation_truncated_payload() {
        let mut data = create_data("Cut");
        data.truncate(data.len() - 5);
        let mut fetcher = MockTransactionFetcher::new();
        fetcher
            .expect_fetch()
            .returning(move |_| Ok(Some(transaction(&data, None))));

        let outcome = resolve_creation(&fetcher, &pump_create_schema(), PUMP_PROGRAM_ID, "s", "r", &fast_policy(1)).await;
        assert!(matches!(outcome, Outcome::SoftFailure { ref reason, .. } if reason.contains("uri")));
    }

    #[tokio::test]
    async fn test_fetch_with_retry_returns_last_error() {
        let mut fetcher = MockTransactionFetcher::new();
        fetcher.expect_fetch().times(2).returning(|_| {
            Err(FetchError::Rpc {
                code: -32005,
                message: "node is behind".to_string(),
            })
        });

        let result = fetch_with_retry(&fetcher, "s", &fast_policy(2)).await;
        assert_err!(result);
    }

    #[tokio::test]
    async fn test_fetch_with_retry_recovers_from_error() {
        let data = create_data("Recovered");
        let mut fetcher = MockTransactionFetcher::new();
        let mut seq = mockall::Sequence::new();
        fetcher
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(FetchError::Rpc { code: -32004, message: "slot skipped".to_string() }));
        fetcher
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(Some(transaction(&data, None))));

        let tx = assert_ok!(fetch_with_retry(&fetcher, "s", &fast_policy(2)).await);
        assert!(tx.is_some());
    }

    // ==================== decode_account tests ====================

    #[test]
    fn test_decode_account_binds_notified_account() {
        let registry = SchemaRegistry::builtin();
        let payload = AccountPayload {
            pubkey: Some("MintPubkey".to_string()),
            data: create_data("Acct"),
            slot: Some(9),
        };
        match decode_account(registry, &payload, "ref") {
            Some(Outcome::Record(record)) => {
                assert_eq!(record.mint_address.as_deref(), Some("MintPubkey"));
                assert_eq!(record.name.as_deref(), Some("Acct"));
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_account_unknown_layout_is_dropped() {
        let payload = AccountPayload {
            pubkey: Some("X".to_string()),
            data: vec![1, 2, 3, 4, 5, 6, 7, 8, 9],
            slot: None,
        };
        assert!(decode_account(SchemaRegistry::builtin(), &payload, "ref").is_none());
    }

    #[test]
    fn test_decode_account_truncated_is_soft_failure() {
        let mut data = create_data("Acct");
        data.truncate(12);
        let payload = AccountPayload {
            pubkey: Some("X".to_string()),
            data,
            slot: None,
        };
        assert!(matches!(
            decode_account(SchemaRegistry::builtin(), &payload, "ref"),
            Some(Outcome::SoftFailure { .. })
        ));
    }

    // ==================== Pipeline tests ====================

    fn pipeline_with(fetcher: MockTransactionFetcher) -> Pipeline {
        Pipeline::new(Arc::new(fetcher), pump_create_schema(), PUMP_PROGRAM_ID, fast_policy(1), 4)
    }

    struct PanickingFetcher;

    #[async_trait::async_trait]
    impl TransactionFetcher for PanickingFetcher {
        async fn fetch(&self, _signature: &str) -> Result<Option<FetchedTransaction>, FetchError> {
            panic!("fetcher blew up")
        }
    }

    #[tokio::test]
    async fn test_pipeline_panicking_fetch_becomes_soft_failure() {
        let mut pipeline = Pipeline::new(
            Arc::new(PanickingFetcher),
            pump_create_schema(),
            PUMP_PROGRAM_ID,
            fast_policy(1),
            4,
        );

        let seq = pipeline.dispatch_fetch("sig".to_string(), "ref".to_string());
        assert!(pipeline.is_in_flight("ref"));

        let (got, outcome) = pipeline.next_result().await.unwrap();
        assert_eq!(got, seq);
        let ready = pipeline.accept(got, outcome);
        assert_eq!(ready, vec![Outcome::soft("ref", "fetch task panicked")]);
        assert!(!pipeline.is_in_flight("ref"));
        assert_eq!(pipeline.in_flight(), 0);
    }

    struct SlowFetcher {
        tx: FetchedTransaction,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl TransactionFetcher for SlowFetcher {
        async fn fetch(&self, _signature: &str) -> Result<Option<FetchedTransaction>, FetchError> {
            tokio::time::sleep(self.delay).await;
            Ok(Some(self.tx.clone()))
        }
    }

    #[tokio::test]
    async fn test_pipeline_record_stamped_at_dispatch() {
        let fetcher = SlowFetcher {
            tx: transaction(&create_data("Slow"), None),
            delay: Duration::from_millis(300),
        };
        let mut pipeline = Pipeline::new(Arc::new(fetcher), pump_create_schema(), PUMP_PROGRAM_ID, fast_policy(1), 4);

        let before = current_timestamp_secs();
        pipeline.dispatch_fetch("sig".to_string(), "ref".to_string());
        let (seq, outcome) = pipeline.next_result().await.unwrap();
        let after = current_timestamp_secs();

        let ready = pipeline.accept(seq, outcome);
        let Outcome::Record(record) = &ready[0] else {
            panic!("expected a record, got {:?}", ready);
        };
        assert!(record.timestamp >= before);
        assert!(record.timestamp < after - 0.2);
    }

    #[tokio::test]
    async fn test_pipeline_submit_waits_behind_fetch() {
        let data = create_data("First");
        let mut fetcher = MockTransactionFetcher::new();
        fetcher
            .expect_fetch()
            .returning(move |_| Ok(Some(transaction(&data, None))));
        let mut pipeline = pipeline_with(fetcher);

        pipeline.dispatch_fetch("sig".to_string(), "fetched".to_string());
        let inline = MintRecord::new("inline", None);
        assert!(pipeline.submit(Outcome::Record(inline)).is_empty());

        let (seq, outcome) = pipeline.next_result().await.unwrap();
        let ready = pipeline.accept(seq, outcome);
        let references: Vec<&str> = ready.iter().map(Outcome::reference).collect();
        assert_eq!(references, vec!["fetched", "inline"]);
    }

    #[tokio::test]
    async fn test_pipeline_shutdown_drops_results_behind_aborted_fetch() {
        let mut fetcher = MockTransactionFetcher::new();
        fetcher.expect_fetch().returning(|_| Ok(None));
        let mut pipeline = Pipeline::new(
            Arc::new(fetcher),
            pump_create_schema(),
            PUMP_PROGRAM_ID,
            FetchPolicy {
                attempts: 10,
                retry_delay: Duration::from_secs(60),
            },
            4,
        );

        pipeline.dispatch_fetch("slow".to_string(), "slow".to_string());
        pipeline.submit(Outcome::soft("later", "skipped"));

        let ready = pipeline.shutdown();
        assert!(ready.is_empty());
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[test]
    fn test_fetch_policy_from_config() {
        let config = IngestorConfig {
            fetch_attempts: 0,
            ..Default::default()
        };
        let policy = FetchPolicy::from_config(&config);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.retry_delay, Duration::from_millis(config.fetch_retry_delay_ms));
    }
}
