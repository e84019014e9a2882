//! Wiring helpers: real connectors talking to a real coordinator over
//! in-process links.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use versioned_replication::{
    memory_link, ConnectionId, ConnectorConfig, ConnectorState, Coordinator, MemoryReplicaStore,
    MemoryTransport, Record, RemoteConnector, ReplicaStore, ReplicationConfig, Version,
};

pub type TestConnector = RemoteConnector<Record, Arc<MemoryReplicaStore<Record>>, Arc<MemoryTransport>>;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A connector driven by its own task.
pub struct TestClient {
    pub id: ConnectionId,
    pub connector: Arc<TestConnector>,
    pub transport: Arc<MemoryTransport>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestClient {
    pub fn store(&self) -> &Arc<MemoryReplicaStore<Record>> {
        self.connector.store()
    }

    /// Stop the driver task and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }

    /// Wait until the driver task has exited on its own (close or error).
    pub async fn finished(self) {
        tokio::time::timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("connector task did not finish")
            .expect("connector task panicked");
    }
}

pub fn test_coordinator() -> Arc<Coordinator<Record>> {
    Arc::new(Coordinator::new(&ReplicationConfig::for_testing("test-server")))
}

/// Connect a fresh in-memory replica.
pub async fn connect_client(coordinator: &Arc<Coordinator<Record>>) -> TestClient {
    connect_with_store(coordinator, Arc::new(MemoryReplicaStore::new())).await
}

/// Connect using an existing replica (e.g. to simulate a reconnect).
pub async fn connect_with_store(
    coordinator: &Arc<Coordinator<Record>>,
    store: Arc<MemoryReplicaStore<Record>>,
) -> TestClient {
    let config = ConnectorConfig::default();
    let (client, server) = memory_link(config.channel_capacity);
    let id = coordinator
        .accept(server.transport, server.events)
        .await
        .expect("coordinator rejected connection");

    let connector = Arc::new(RemoteConnector::new(
        store,
        Arc::clone(&client.transport),
        &config,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = Arc::clone(&connector);
    let events = client.events;
    let handle = tokio::spawn(async move { driver.run(events, shutdown_rx).await });

    TestClient {
        id,
        connector,
        transport: client.transport,
        shutdown_tx,
        handle,
    }
}

/// Poll until `check` passes or panic after the timeout.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_version(store: &Arc<MemoryReplicaStore<Record>>, version: Version) {
    eventually(&format!("watermark {}", version), || async move {
        store.get_version().await.unwrap() == version
    })
    .await;
}

pub async fn wait_for_state(connector: &TestConnector, state: ConnectorState) {
    let mut rx = connector.state_receiver();
    let result = tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(|current| *current == state)).await;
    assert!(
        matches!(result, Ok(Ok(_))),
        "timed out waiting for connector state {}",
        state
    );
}

pub fn user(id: &str, name: &str) -> Record {
    Record::new("user", id).with("name", name)
}
