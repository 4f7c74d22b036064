pub mod broker;
pub mod client;
pub mod connection;
pub mod error;
pub mod hasher;
pub mod jobs;
pub mod miner;
pub mod options;
pub mod payments;
pub mod protocol;
pub mod solution;
pub mod status;
pub mod types;

use async_trait::async_trait;
use broker::Broker;
use client::Client;
use connection::ClientConfig;
use error::MinerError;
use jobs::JobManager;
use miner::MinerPool;
use options::Options;
use payments::PaymentLog;
use protocol::Request;
use solution::SolutionManager;
use status::StatusReporter;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use types::ConnectionState;

/// Name announced to the pool in JOIN.
pub const MINER_NAME: &str = concat!("rn", env!("CARGO_PKG_VERSION"));

const OUTBOUND_BUFFER: usize = 100;

/// Everything a service needs for one connection cycle.
///
/// Tasks spawned on `tracker` are awaited before the next cycle starts, and
/// `cancel` fires when the connection is torn down.
#[derive(Clone)]
pub struct Cycle {
    pub broker: Broker,
    pub tracker: TaskTracker,
    pub cancel: CancellationToken,
    pub wallet: String,
    hash_rate: Arc<AtomicU64>,
    outbound: mpsc::Sender<Request>,
}

impl Cycle {
    /// Creates a cycle whose token is a child of `parent`. The returned
    /// receiver yields every request handed to [`Cycle::send`].
    pub fn new(
        parent: &CancellationToken,
        wallet: impl Into<String>,
        hash_rate: Arc<AtomicU64>,
    ) -> (Self, mpsc::Receiver<Request>) {
        let cancel = parent.child_token();
        let (outbound, requests) = mpsc::channel(OUTBOUND_BUFFER);
        let cycle = Self {
            broker: Broker::new(cancel.clone()),
            tracker: TaskTracker::new(),
            cancel,
            wallet: wallet.into(),
            hash_rate,
            outbound,
        };
        (cycle, requests)
    }

    /// Queues a request for the pool. Dropped if the cycle is over.
    pub async fn send(&self, request: Request) {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.outbound.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => permit.send(request),
            None => log::debug!(target: "noso", "Connection closed, dropping {}", request),
        }
    }

    /// Total miner hash rate in H/s.
    pub fn hash_rate(&self) -> u64 {
        self.hash_rate.load(Ordering::Relaxed)
    }

    pub fn set_hash_rate(&self, hash_rate: u64) {
        self.hash_rate.store(hash_rate, Ordering::Relaxed);
    }

    /// Cancels the cycle and waits for every tracked task to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// A component that lives for one connection cycle.
#[async_trait]
pub trait CycleService: Send + Sync {
    /// Subscribe to the cycle's broker and spawn tasks on its tracker.
    /// Must not return before its subscriptions are registered.
    async fn start(&self, cycle: &Cycle) -> Result<(), MinerError>;
}

/// Mines against the configured pool until `shutdown` fires.
pub async fn run(options: Options, shutdown: CancellationToken) -> Result<(), MinerError> {
    options.validate()?;

    let payments = PaymentLog::new(&options.payments_file);
    payments.create().await?;

    let tag = hasher::version_tag(MINER_NAME);
    log::info!(target: "noso", "{} starting with {} workers", MINER_NAME, options.cpu);

    let client = Client::new(
        options.endpoint(),
        options.password.clone(),
        options.wallets.clone(),
        ClientConfig::default(),
        shutdown.clone(),
    )
    .service(JobManager::new(tag))
    .service(SolutionManager::new(options.show_pop))
    .service(MinerPool::new(options.cpu))
    .service(StatusReporter::new(
        options.address.clone(),
        Duration::from_secs(options.status_interval),
        payments,
    ));
    let client = Arc::new(client);

    let mut state = client.state();
    state.borrow_and_update();

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    if options.exit_on_retry {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *state.borrow_and_update() == ConnectionState::Disconnected {
                        log::error!(target: "noso", "Connection lost, exiting instead of retrying");
                        shutdown.cancel();
                        let _ = runner.await;
                        return Err(MinerError::Connection(
                            "connection lost and exit-on-retry is set".into(),
                        ));
                    }
                }
            }
        }
    }

    match runner.await {
        Ok(result) => result,
        Err(err) => Err(MinerError::Connection(format!("client task failed - {}", err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cycle_send_after_shutdown_is_dropped() {
        let root = CancellationToken::new();
        let (cycle, mut requests) = Cycle::new(&root, "wallet", Arc::new(AtomicU64::new(0)));

        cycle.send(Request::payment()).await;
        assert_eq!(requests.recv().await, Some(Request::Payment));

        cycle.shutdown().await;
        cycle.send(Request::payment()).await;
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cycle_send_on_full_queue_returns_on_cancel() {
        let root = CancellationToken::new();
        let (cycle, mut requests) = Cycle::new(&root, "wallet", Arc::new(AtomicU64::new(0)));
        for _ in 0..OUTBOUND_BUFFER {
            cycle.send(Request::payment()).await;
        }

        let blocked = {
            let cycle = cycle.clone();
            tokio::spawn(async move { cycle.send(Request::ping(1_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        cycle.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();

        let mut queued = 0;
        while let Ok(request) = requests.try_recv() {
            assert_eq!(request, Request::Payment);
            queued += 1;
        }
        assert_eq!(queued, OUTBOUND_BUFFER);
    }

    #[tokio::test]
    async fn test_cycle_follows_parent_token() {
        let root = CancellationToken::new();
        let (cycle, _requests) = Cycle::new(&root, "wallet", Arc::new(AtomicU64::new(0)));
        root.cancel();
        assert!(cycle.cancel.is_cancelled());
        assert!(cycle.broker.subscribe(types::Topic::Join).await.is_err());
    }

    #[test]
    fn test_miner_name() {
        assert!(MINER_NAME.starts_with("rn"));
        assert!(!MINER_NAME.contains(' '));
    }
}
