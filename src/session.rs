//! Subscription Session
//!
//! Owns one logical subscription to the pubsub endpoint: connects, subscribes,
//! keeps the connection alive, routes inbound messages and reconnects with
//! jittered exponential backoff when the transport drops.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Disconnected (transport closed)
//!                     |              |
//!                     +--------------+--> Closing (shutdown, terminal)
//!                                    +--> Failed  (reconnect budget exhausted)
//! ```
//!
//! `Subscribed` is entered as soon as the handshake completes. The subscribe
//! ack only records the subscription id; a rejected subscribe drops the
//! connection and goes through the reconnect path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::spawn_blocking;
use tokio::time::{interval_at, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Commitment, IngestorConfig, SubscriptionKind};
use crate::fetch::TransactionFetcher;
use crate::pipeline::{decode_account, FetchPolicy, Outcome, Pipeline};
use crate::router::{classify, is_creation_event, Classified};
use crate::schema::{SchemaError, SchemaRegistry};
use crate::store::{explorer_address_url, explorer_url, MintRecord, RecordSink};
use crate::transport::{Connection, Connector, Frame};

/// Tracing target for records that could not be stored
pub const DEAD_LETTER_TARGET: &str = "mintscope::dead_letter";

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    Closing,
    Failed,
}

/// Counters reported when a session ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_received: u64,
    pub creation_events: u64,
    pub records_appended: u64,
    pub soft_failures: u64,
    pub protocol_errors: u64,
    pub duplicates_skipped: u64,
    pub reconnects: u64,
    pub dropped_records: u64,
}

/// Full-jitter exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn from_config(config: &IngestorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Upper bound of the next delay: `initial * 2^attempt`, capped at `max`
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Uniformly random delay in `[0, ceiling]`; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let ceiling_ms = self.ceiling().as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// A subscribe request; identical on every reconnect except for its id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub id: u64,
    pub kind: SubscriptionKind,
    pub program_id: String,
    pub commitment: Commitment,
}

impl SubscribeRequest {
    pub fn params(&self) -> Value {
        match self.kind {
            SubscriptionKind::Logs => json!([
                { "mentions": [self.program_id] },
                { "commitment": self.commitment.as_str() }
            ]),
            SubscriptionKind::Program => json!([
                self.program_id,
                { "encoding": "base64", "commitment": self.commitment.as_str() }
            ]),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": self.id,
            "method": self.kind.method(),
            "params": self.params(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Reconnect,
}

/// Resolves once shutdown is requested or the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// One logical subscription and everything it feeds
pub struct Session {
    config: IngestorConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn RecordSink>,
    pipeline: Pipeline,
    backoff: Backoff,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    last_activity: Option<Instant>,
    next_request_id: u64,
    pending_subscribe: Option<u64>,
    subscription_id: Option<u64>,
    consecutive_failures: u32,
    stats: SessionStats,
}

impl Session {
    /// Create a session
    ///
    /// Fails when the configured creation instruction is not in the registry.
    pub fn new(
        config: IngestorConfig,
        connector: Arc<dyn Connector>,
        fetcher: Arc<dyn TransactionFetcher>,
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn RecordSink>,
    ) -> Result<Self, SchemaError> {
        let schema = registry.lookup(&config.instruction)?.clone();
        let pipeline = Pipeline::new(
            fetcher,
            schema,
            config.program_id.clone(),
            FetchPolicy::from_config(&config),
            config.max_in_flight,
        );

        Ok(Self {
            backoff: Backoff::from_config(&config),
            config,
            connector,
            registry,
            store,
            pipeline,
            state: SessionState::Disconnected,
            state_tx: watch::channel(SessionState::Disconnected).0,
            last_activity: None,
            next_request_id: 1,
            pending_subscribe: None,
            subscription_id: None,
            consecutive_failures: 0,
            stats: SessionStats::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Follow state transitions while the session runs
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// When the last frame of any kind arrived
    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Server-assigned id of the current subscription
    pub fn subscription_id(&self) -> Option<u64> {
        self.subscription_id
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Run until shutdown is signalled or the reconnect budget is exhausted
    ///
    /// In-flight fetches are aborted on exit, completed records are stored and
    /// the store is checkpointed.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SessionStats {
        info!(
            "Starting {} session for program {} at {} (commitment {})",
            self.config.subscription.method(),
            self.config.program_id,
            self.config.ws_url,
            self.config.commitment
        );

        loop {
            self.set_state(SessionState::Connecting);
            let connector = Arc::clone(&self.connector);
            let connected = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => None,
                result = connector.connect(&self.config.ws_url) => Some(result),
            };

            let exit = match connected {
                None => break,
                Some(Ok(conn)) => self.serve(conn, &mut shutdown).await,
                Some(Err(e)) => {
                    warn!("Connection to {} failed: {}", self.config.ws_url, e);
                    Exit::Lost
                }
            };
            if exit == Exit::Shutdown {
                break;
            }

            self.set_state(SessionState::Disconnected);
            self.subscription_id = None;
            self.consecutive_failures += 1;
            if let Some(max) = self.config.max_reconnect_attempts {
                if self.consecutive_failures > max {
                    error!("Max reconnection attempts ({}) exceeded", max);
                    self.set_state(SessionState::Failed);
                    break;
                }
            }

            let delay = self.backoff.next_delay();
            warn!(
                "Reconnecting (attempt {}), waiting {:?}",
                self.consecutive_failures, delay
            );
            self.stats.reconnects += 1;
            if !self.pause(delay, &mut shutdown).await {
                break;
            }
        }

        self.finish().await;
        self.stats.clone()
    }

    /// Subscribe on a fresh connection and process traffic until it ends
    async fn serve(&mut self, mut conn: Box<dyn Connection>, shutdown: &mut watch::Receiver<bool>) -> Exit {
        self.set_state(SessionState::Subscribed);
        let request = SubscribeRequest {
            id: self.next_request_id,
            kind: self.config.subscription,
            program_id: self.config.program_id.clone(),
            commitment: self.config.commitment,
        };
        self.next_request_id += 1;
        self.pending_subscribe = Some(request.id);

        if let Err(e) = conn.send_text(request.to_json().to_string()).await {
            warn!("Failed to send subscribe request: {}", e);
            return Exit::Lost;
        }
        debug!("Sent {} request {}", request.kind.method(), request.id);

        let period = self.config.keepalive_interval();
        let mut keepalive = interval_at(tokio::time::Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => break Exit::Shutdown,
                _ = keepalive.tick() => {
                    if let Err(e) = conn.ping().await {
                        warn!("Keep-alive ping failed: {}", e);
                        break Exit::Lost;
                    }
                }
                Some((seq, outcome)) = self.pipeline.next_result() => {
                    self.complete(seq, outcome).await;
                }
                frame = conn.next_frame() => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        self.last_activity = Some(Instant::now());
                        if self.handle_message(&text).await == Flow::Reconnect {
                            break Exit::Lost;
                        }
                    }
                    Some(Ok(Frame::Binary(bytes))) => {
                        self.last_activity = Some(Instant::now());
                        debug!("Ignoring {} byte binary frame", bytes.len());
                    }
                    Some(Ok(Frame::Control)) => {
                        self.last_activity = Some(Instant::now());
                    }
                    Some(Err(e)) => {
                        warn!("Transport error: {}", e);
                        break Exit::Lost;
                    }
                    None => {
                        info!("Connection closed by peer");
                        break Exit::Lost;
                    }
                },
            }
        };

        self.pending_subscribe = None;
        if exit == Exit::Shutdown {
            self.set_state(SessionState::Closing);
            if let Err(e) = conn.close().await {
                debug!("Close failed: {}", e);
            }
        }
        exit
    }

    /// Wait out a backoff delay while still storing finished fetches
    ///
    /// Returns `false` if shutdown was requested meanwhile.
    async fn pause(&mut self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return true,
                _ = wait_for_shutdown(shutdown) => return false,
                Some((seq, outcome)) = self.pipeline.next_result() => {
                    self.complete(seq, outcome).await;
                }
            }
        }
    }

    async fn handle_message(&mut self, text: &str) -> Flow {
        self.stats.messages_received += 1;

        let classified = match classify(text) {
            Ok(classified) => classified,
            Err(e) => {
                self.stats.protocol_errors += 1;
                warn!("Dropping malformed message: {}", e);
                return Flow::Continue;
            }
        };

        match classified {
            Classified::Logs(payload) => {
                if !is_creation_event(&payload.logs, &self.config.create_marker) {
                    debug!("No creation marker in {}", payload.signature);
                    return Flow::Continue;
                }
                self.stats.creation_events += 1;
                let reference = explorer_url(&payload.signature, &self.config.explorer_cluster);
                if self.is_duplicate(&reference) {
                    return Flow::Continue;
                }
                info!("Creation event in {} (slot {:?})", payload.signature, payload.slot);
                self.pipeline.dispatch_fetch(payload.signature, reference);
            }
            Classified::Account(payload) => {
                let Some(pubkey) = payload.pubkey.as_deref() else {
                    debug!("Ignoring account notification without pubkey");
                    return Flow::Continue;
                };
                let reference = explorer_address_url(pubkey, &self.config.explorer_cluster);
                let Some(outcome) = decode_account(&self.registry, &payload, &reference) else {
                    debug!("Account {} does not match a known layout", pubkey);
                    return Flow::Continue;
                };
                self.stats.creation_events += 1;
                if self.is_duplicate(&reference) {
                    return Flow::Continue;
                }
                let ready = self.pipeline.submit(outcome);
                self.persist_all(ready).await;
            }
            Classified::Discarded { signature } => {
                debug!("Ignoring failed transaction {}", signature);
            }
            Classified::Ack {
                request_id,
                subscription,
            } => {
                if self.pending_subscribe == Some(request_id) {
                    self.pending_subscribe = None;
                    self.subscription_id = Some(subscription);
                    self.backoff.reset();
                    self.consecutive_failures = 0;
                    info!("Subscription {} confirmed", subscription);
                } else {
                    debug!("Ack for unknown request {}", request_id);
                }
            }
            Classified::RpcError {
                request_id,
                code,
                message,
            } => {
                if request_id.is_some() && request_id == self.pending_subscribe {
                    warn!("Subscribe request rejected ({}): {}", code, message);
                    return Flow::Reconnect;
                }
                warn!("RPC error {}: {}", code, message);
            }
            Classified::Unrecognized => {
                debug!("Ignoring unrecognized message");
            }
        }
        Flow::Continue
    }

    fn is_duplicate(&mut self, reference: &str) -> bool {
        if self.pipeline.is_in_flight(reference) || self.store.contains(reference) {
            self.stats.duplicates_skipped += 1;
            debug!("Skipping already seen {}", reference);
            return true;
        }
        false
    }

    async fn complete(&mut self, seq: u64, outcome: Outcome) {
        let ready = self.pipeline.accept(seq, outcome);
        self.persist_all(ready).await;
    }

    async fn persist_all(&mut self, outcomes: Vec<Outcome>) {
        for outcome in outcomes {
            self.persist(outcome).await;
        }
    }

    async fn persist(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Record(record) => {
                if self.store.contains(&record.transaction_url) {
                    self.stats.duplicates_skipped += 1;
                    return;
                }
                self.append_with_retry(record).await;
            }
            Outcome::SoftFailure { reference, reason } => {
                self.stats.soft_failures += 1;
                warn!("Skipping {}: {}", reference, reason);
            }
        }
    }

    /// Append on the blocking pool, retrying with doubling delays
    ///
    /// Records that still fail go to the dead-letter log.
    async fn append_with_retry(&mut self, record: MintRecord) {
        let attempts = self.config.store_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.store_retry_delay_ms);

        for attempt in 1..=attempts {
            let store = Arc::clone(&self.store);
            let pending = record.clone();
            match spawn_blocking(move || store.append(pending)).await {
                Ok(Ok(seq)) => {
                    self.stats.records_appended += 1;
                    info!(
                        "Stored record #{} for {} (mint {})",
                        seq,
                        record.transaction_url,
                        record.mint_address.as_deref().unwrap_or("unknown")
                    );
                    return;
                }
                Ok(Err(e)) => warn!("Append attempt {}/{} failed: {}", attempt, attempts, e),
                Err(e) => warn!("Append task {}/{} failed: {}", attempt, attempts, e),
            }
            if attempt < attempts {
                sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        self.stats.dropped_records += 1;
        let line = serde_json::to_string(&record).unwrap_or_else(|_| record.transaction_url.clone());
        error!(target: DEAD_LETTER_TARGET, "{}", line);
    }

    /// Drain completed work and checkpoint the store
    async fn finish(&mut self) {
        if self.state != SessionState::Failed {
            self.set_state(SessionState::Closing);
        }

        let ready = self.pipeline.shutdown();
        self.persist_all(ready).await;

        let store = Arc::clone(&self.store);
        match spawn_blocking(move || store.checkpoint()).await {
            Ok(Ok(())) => debug!("Checkpointed store on shutdown"),
            Ok(Err(e)) => warn!("Checkpoint on shutdown failed: {}", e),
            Err(e) => warn!("Checkpoint task failed: {}", e),
        }

        info!("Session ended in state {:?}: {:?}", self.state, self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Backoff tests ====================

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30_000));
        let mut ceilings = Vec::new();
        for _ in 0..7 {
            ceilings.push(backoff.ceiling().as_millis());
            backoff.next_delay();
        }
        assert_eq!(ceilings, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_backoff_delay_within_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        for _ in 0..50 {
            let ceiling = backoff.ceiling();
            assert!(backoff.next_delay() <= ceiling);
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::from_config(&IngestorConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_survives_many_attempts() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(30));
    }

    // ==================== SubscribeRequest tests ====================

    fn request(kind: SubscriptionKind, id: u64) -> SubscribeRequest {
        SubscribeRequest {
            id,
            kind,
            program_id: "Prog".to_string(),
            commitment: Commitment::Processed,
        }
    }

    #[test]
    fn test_logs_subscribe_shape() {
        let value = request(SubscriptionKind::Logs, 1).to_json();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "logsSubscribe",
                "params": [{"mentions": ["Prog"]}, {"commitment": "processed"}]
            })
        );
    }

    #[test]
    fn test_program_subscribe_shape() {
        let value = request(SubscriptionKind::Program, 7).to_json();
        assert_eq!(value["method"], "programSubscribe");
        assert_eq!(value["params"][0], "Prog");
        assert_eq!(value["params"][1]["encoding"], "base64");
        assert_eq!(value["params"][1]["commitment"], "processed");
    }

    #[test]
    fn test_resubscribe_differs_only_by_id() {
        let first = request(SubscriptionKind::Logs, 1).to_json();
        let second = request(SubscriptionKind::Logs, 2).to_json();
        assert_eq!(first["params"], second["params"]);
        assert_eq!(first["method"], second["method"]);
        assert_ne!(first["id"], second["id"]);
    }

    // ==================== shutdown signal tests ====================

    #[tokio::test]
    async fn test_wait_for_shutdown_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_pending_without_signal() {
        let (_tx, mut rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_millis(20), wait_for_shutdown(&mut rx)).await;
        assert!(result.is_err());
    }
}
