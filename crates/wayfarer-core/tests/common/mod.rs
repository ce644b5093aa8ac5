//! Shared test doubles for integration tests

// Not every test binary uses every helper
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use wayfarer_core::{
    ConnectivityMonitor, ConnectivityState, DeviceId, DeviceKeyPair, LocalStore,
    MemoryCredentialStore, Messenger, RemoteError, RemoteEvent, RemoteService, SyncOrchestrator,
    UserId,
};

/// Scripted remote service.
///
/// Responds per-operation from canned queues; with auto-confirm enabled an
/// unscripted `sendMessage` succeeds with a server record echoing the
/// client id and sequence. Every call is logged for order assertions.
pub struct ScriptedRemote {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, RemoteError>>>>,
    calls: Mutex<Vec<(String, Value)>>,
    auto_confirm_sends: AtomicBool,
    send_counter: AtomicU64,
    event_tx: Mutex<Option<mpsc::Sender<RemoteEvent>>>,
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            auto_confirm_sends: AtomicBool::new(false),
            send_counter: AtomicU64::new(0),
            event_tx: Mutex::new(None),
        }
    }
}

impl ScriptedRemote {
    pub fn push_response(&self, operation: &str, result: Result<Value, RemoteError>) {
        self.responses
            .lock()
            .entry(operation.to_string())
            .or_default()
            .push_back(result);
    }

    /// Unscripted sendMessage calls succeed with an echoing server record.
    pub fn set_auto_confirm_sends(&self, enabled: bool) {
        self.auto_confirm_sends.store(enabled, Ordering::SeqCst);
    }

    pub fn calls_for(&self, operation: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Inject an event into the live subscription stream.
    pub async fn emit(&self, event: RemoteEvent) {
        let tx = self
            .event_tx
            .lock()
            .clone()
            .expect("subscription not started");
        tx.send(event).await.expect("subscription receiver dropped");
    }

    fn confirm_send(&self, variables: &Value) -> Value {
        let n = self.send_counter.fetch_add(1, Ordering::SeqCst);
        json!({
            "id": format!("srv-{}", n),
            "conversationId": variables["conversationId"],
            "senderUserId": variables["senderUserId"],
            "senderDeviceId": variables["senderDeviceId"],
            "ciphertext": variables["ciphertext"],
            "meta": variables["meta"],
            "kind": variables["kind"],
            "createdAt": 1_700_000_000_000i64 + (n as i64) * 1000,
            "clientId": variables["clientId"],
            "clientSeq": variables["clientSeq"],
        })
    }
}

#[async_trait]
impl RemoteService for ScriptedRemote {
    async fn execute(&self, operation: &str, variables: Value) -> Result<Value, RemoteError> {
        self.calls
            .lock()
            .push((operation.to_string(), variables.clone()));

        if let Some(result) = self
            .responses
            .lock()
            .get_mut(operation)
            .and_then(|q| q.pop_front())
        {
            return result;
        }
        if operation == "sendMessage" && self.auto_confirm_sends.load(Ordering::SeqCst) {
            return Ok(self.confirm_send(&variables));
        }
        Err(RemoteError::network("no scripted response"))
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _variables: Value,
    ) -> Result<mpsc::Receiver<RemoteEvent>, RemoteError> {
        let (tx, rx) = mpsc::channel(16);
        *self.event_tx.lock() = Some(tx);
        Ok(rx)
    }
}

/// A full authenticated session against a scripted remote.
pub struct Session {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub messenger: Messenger,
    pub remote: Arc<ScriptedRemote>,
    pub monitor: ConnectivityMonitor,
    /// The provisioned device key pair, for sealing fixture rows the
    /// session can read
    pub keypair: DeviceKeyPair,
    _temp: TempDir,
}

/// Install the test log subscriber once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Provision a session: fresh store, generated device key pair, monitor
/// starting in the given connectivity state.
pub async fn provision_session(user: &str, device: &str, initial: ConnectivityState) -> Session {
    init_tracing();
    let temp = TempDir::new().expect("temp dir");
    let store = LocalStore::new(temp.path().join("mirror.redb")).expect("store");
    let remote = Arc::new(ScriptedRemote::default());
    let orchestrator = SyncOrchestrator::new(store, remote.clone());

    let keypair = DeviceKeyPair::generate(DeviceId::from_string(device));
    let credentials = MemoryCredentialStore::with_keypair(keypair.clone());
    let messenger = Messenger::new(
        orchestrator.clone(),
        &credentials,
        UserId::from_string(user),
    )
    .await
    .expect("messenger");

    Session {
        orchestrator,
        messenger,
        remote,
        monitor: ConnectivityMonitor::new(initial),
        keypair,
        _temp: temp,
    }
}

/// Poll until the outbox is empty or the timeout elapses.
pub async fn wait_for_empty_outbox(orchestrator: &SyncOrchestrator) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if orchestrator.outbox().is_empty().expect("outbox") {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("outbox did not drain in time");
}
