use crate::noso::{
    broker::Subscription,
    connection::{self, ClientConfig, Credentials},
    error::MinerError,
    protocol::Request,
    types::{ConnectionState, Event, Topic},
    Cycle, CycleService, MINER_NAME,
};
use std::collections::VecDeque;
use std::time::Duration;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

/// Pause before redialing a pool that answered ALREADYCONNECTED; never longer
/// than the regular reconnect interval.
pub const ALREADY_CONNECTED_PAUSE: Duration = Duration::from_millis(250);

/// Keeps a pool connection alive and owns the broker of the current cycle.
///
/// Each connection cycle gets a fresh broker, outbound queue and task
/// tracker. Registered services are restarted on every cycle before the
/// socket is dialed.
pub struct Client {
    address: String,
    password: String,
    wallets: Mutex<VecDeque<String>>,
    config: ClientConfig,
    services: Vec<Arc<dyn CycleService>>,
    cycle: Mutex<Option<Cycle>>,
    hash_rate: Arc<AtomicU64>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(
        address: impl Into<String>,
        password: impl Into<String>,
        wallets: Vec<String>,
        config: ClientConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            address: address.into(),
            password: password.into(),
            wallets: Mutex::new(wallets.into()),
            config,
            services: Vec::new(),
            cycle: Mutex::new(None),
            hash_rate: Arc::new(AtomicU64::new(0)),
            state,
            cancel,
        }
    }

    /// Registers a service; services start in registration order.
    pub fn service(mut self, service: impl CycleService + 'static) -> Self {
        self.services.push(Arc::new(service));
        self
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn hash_rate(&self) -> u64 {
        self.hash_rate.load(Ordering::Relaxed)
    }

    pub fn set_hash_rate(&self, hash_rate: u64) {
        self.hash_rate.store(hash_rate, Ordering::Relaxed);
    }

    /// The cycle currently running, if any.
    pub async fn current_cycle(&self) -> Option<Cycle> {
        self.cycle.lock().await.clone()
    }

    /// Queues a command for the pool on the current connection.
    pub async fn send(&self, request: Request) {
        match self.current_cycle().await {
            Some(cycle) => cycle.send(request).await,
            None => log::warn!(target: "client", "Not connected, dropping {}", request),
        }
    }

    pub async fn publish(&self, event: Event) {
        match self.current_cycle().await {
            Some(cycle) => cycle.broker.publish(event).await,
            None => log::debug!(target: "client", "Not connected, dropping {:?}", event),
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> Result<Subscription, MinerError> {
        let cycle = self.current_cycle().await.ok_or(MinerError::BrokerClosed)?;
        cycle.broker.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(cycle) = self.current_cycle().await {
            cycle.broker.unsubscribe(subscription).await;
        }
    }

    /// Runs connection cycles until the client's token is cancelled.
    pub async fn run(&self) -> Result<(), MinerError> {
        if self.wallets.lock().await.is_empty() {
            return Err(MinerError::Config("at least one wallet is required".into()));
        }

        while !self.cancel.is_cancelled() {
            let outcome = self.run_cycle().await;
            self.state.send_replace(ConnectionState::Disconnected);

            match outcome {
                Ok(()) => log::info!(target: "client", "Disconnected from {}", self.address),
                Err(MinerError::AlreadyConnected) => {
                    let pause = self.config.reconnect_interval.min(ALREADY_CONNECTED_PAUSE);
                    log::warn!(
                        target: "client",
                        "Pool reports this address is already connected, reconnecting in {:?}",
                        pause
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(pause) => continue,
                    }
                }
                Err(MinerError::PassFailed) => {
                    log::error!(target: "client", "Pool {} rejected the password", self.address)
                }
                Err(err) => log::warn!(target: "client", "Connection to {} failed: {}", self.address, err),
            }

            if self.cancel.is_cancelled() {
                break;
            }
            log::info!(target: "client", "Reconnecting in {:?}", self.config.reconnect_interval);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.reconnect_interval) => {}
            }
        }

        Ok(())
    }

    /// First wallet becomes current and moves to the back of the rotation.
    async fn next_wallet(&self) -> Option<String> {
        let mut wallets = self.wallets.lock().await;
        let wallet = wallets.pop_front()?;
        wallets.push_back(wallet.clone());
        Some(wallet)
    }

    async fn run_cycle(&self) -> Result<(), MinerError> {
        let wallet = self
            .next_wallet()
            .await
            .ok_or_else(|| MinerError::Config("no wallet configured".into()))?;

        let (cycle, requests) = Cycle::new(&self.cancel, wallet, self.hash_rate.clone());
        *self.cycle.lock().await = Some(cycle.clone());
        self.state.send_replace(ConnectionState::Connecting);

        let result = self.drive(&cycle, requests).await;

        cycle.shutdown().await;
        *self.cycle.lock().await = None;
        result
    }

    async fn drive(
        &self,
        cycle: &Cycle,
        requests: mpsc::Receiver<Request>,
    ) -> Result<(), MinerError> {
        for service in &self.services {
            service.start(cycle).await?;
        }

        log::info!(
            target: "client",
            "Connecting to {} with wallet {}",
            self.address,
            cycle.wallet
        );
        let stream = connection::dial(&self.address, &self.config).await?;
        let (read_half, write_half) = stream.into_split();
        self.state.send_replace(ConnectionState::Connected);

        let mut joins = cycle.broker.subscribe(Topic::Join).await?;
        let pongs = cycle.broker.subscribe(Topic::PingPong).await?;

        let credentials = Credentials {
            password: self.password.clone(),
            wallet: cycle.wallet.clone(),
        };
        cycle.tracker.spawn(connection::send_loop(
            write_half,
            requests,
            credentials,
            cycle.cancel.clone(),
        ));
        cycle.tracker.spawn(connection::receive_loop(
            read_half,
            cycle.broker.clone(),
            self.config.connection_timeout,
            cycle.cancel.clone(),
        ));
        cycle.tracker.spawn(connection::watchdog(
            pongs,
            self.config.connection_timeout,
            cycle.cancel.clone(),
        ));

        self.state.send_replace(ConnectionState::Joining);
        cycle.send(Request::join(MINER_NAME)).await;
        let joined = self.await_join(cycle, &mut joins).await;
        cycle.broker.unsubscribe(&joins).await;
        joined?;

        self.state.send_replace(ConnectionState::Joined);
        cycle
            .tracker
            .spawn(connection::ping_loop(cycle.clone(), self.config.ping_interval));

        cycle.cancel.cancelled().await;
        Ok(())
    }

    async fn await_join(
        &self,
        cycle: &Cycle,
        joins: &mut Subscription,
    ) -> Result<(), MinerError> {
        let deadline = sleep(self.config.join_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cycle.cancel.cancelled() => {
                    // The pool often rejects and hangs up in one go.
                    while let Ok(event) = joins.try_recv() {
                        if let Some(Err(err)) = join_outcome(event) {
                            return Err(err);
                        }
                    }
                    return Err(MinerError::Connection("connection closed while joining".into()));
                }
                event = joins.recv() => match event {
                    Some(event) => match join_outcome(event) {
                        Some(outcome) => return outcome,
                        None => continue,
                    },
                    None => return Err(MinerError::BrokerClosed),
                },
                _ = &mut deadline => return Err(MinerError::JoinTimeout),
            }
        }
    }
}

/// Maps a Join topic event to the result of joining, if it decides one.
fn join_outcome(event: Event) -> Option<Result<(), MinerError>> {
    match event {
        Event::JoinOk(join) => {
            log::info!(
                target: "client",
                "Joined pool {} at block {}, miner seed {}",
                join.pool_addr,
                join.pool_data.block,
                join.miner_seed
            );
            Some(Ok(()))
        }
        Event::AlreadyConnected => Some(Err(MinerError::AlreadyConnected)),
        Event::PassFailed => Some(Err(MinerError::PassFailed)),
        _ => None,
    }
}
