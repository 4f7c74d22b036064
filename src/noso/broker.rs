use crate::noso::{
    error::MinerError,
    types::{Event, Topic},
};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// How long a publish may block on a single subscriber before the broker is
/// considered hung.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);
/// How long subscribe waits for the dispatch loop to register the channel.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Capacity of each subscriber's delivery channel.
pub const SUBSCRIPTION_BUFFER: usize = 16;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub publish_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub subscription_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            publish_timeout: PUBLISH_TIMEOUT,
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
            subscription_buffer: SUBSCRIPTION_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receive side of a topic subscription. Yields `None` once the broker has
/// dropped the subscription, either through unsubscribe or shutdown.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

enum Command {
    Subscribe {
        topic: Topic,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Publish(Event),
    Count(oneshot::Sender<usize>),
    Flush(oneshot::Sender<()>),
}

struct Entry {
    id: SubscriptionId,
    tx: mpsc::Sender<Event>,
}

/// Topic-based fan-out of events.
///
/// All registry state lives in a single dispatch task; the handle only sends
/// commands to it, so cloning the handle is cheap. The broker lives exactly as
/// long as its cancellation token, and every subscription channel is closed
/// when the dispatch task exits.
#[derive(Clone)]
pub struct Broker {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_config(cancel, BrokerConfig::default())
    }

    pub fn with_config(cancel: CancellationToken, config: BrokerConfig) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let dispatcher = Dispatcher {
            topics: HashMap::new(),
            next_id: 0,
            cancel: cancel.clone(),
            config: config.clone(),
        };
        tokio::spawn(dispatcher.run(rx));

        Self {
            commands,
            cancel,
            config,
        }
    }

    /// Registers a new subscription. Returns only once the dispatch loop has
    /// recorded it, so any event published afterwards will be delivered.
    pub async fn subscribe(&self, topic: Topic) -> Result<Subscription, MinerError> {
        if self.cancel.is_cancelled() {
            return Err(MinerError::BrokerClosed);
        }

        let (reply, rx) = oneshot::channel();
        let registered = async {
            self.commands
                .send(Command::Subscribe { topic, reply })
                .await
                .map_err(|_| MinerError::BrokerClosed)?;
            rx.await.map_err(|_| MinerError::BrokerClosed)
        };

        match timeout(self.config.subscribe_timeout, registered).await {
            Ok(result) => result,
            Err(_) => {
                log::error!(target: "broker", "Timed out subscribing to {} topic", topic);
                Err(MinerError::SubscribeTimeout)
            }
        }
    }

    /// Removes a subscription. Its channel is closed once this returns;
    /// events already buffered are still readable.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let (reply, rx) = oneshot::channel();
        let id = subscription.id();
        let topic = subscription.topic();
        let removed = async {
            self.commands
                .send(Command::Unsubscribe { id, reply })
                .await
                .ok()?;
            rx.await.ok()
        };

        match timeout(self.config.subscribe_timeout, removed).await {
            Ok(Some(true)) => {}
            Ok(Some(false)) => {
                log::warn!(target: "broker", "Subscription {} to {} topic was not registered", id, topic)
            }
            Ok(None) => {
                log::debug!(target: "broker", "Broker closed before unsubscribing {}", id)
            }
            Err(_) => log::error!(target: "broker", "Timed out unsubscribing {} from {} topic", id, topic),
        }
    }

    /// Hands an event to the dispatch loop. A no-op once the broker is closed.
    pub async fn publish(&self, event: Event) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            res = self.commands.send(Command::Publish(event)) => {
                if res.is_err() {
                    log::debug!(target: "broker", "Dropped event published after shutdown");
                }
            }
        }
    }

    /// Hands an event to the dispatch loop without waiting. Returns false and
    /// drops the event if the command queue is full or the broker is closed.
    ///
    /// Subscribers publishing from inside their own receive loop use this, since
    /// the dispatch loop may itself be waiting on them.
    pub fn try_publish(&self, event: Event) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.commands.try_send(Command::Publish(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!(target: "broker", "Command queue full, dropped event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Waits until every event published before this call has been handed to
    /// its subscribers. Gives up after the subscribe timeout.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        let drained = async {
            self.commands.send(Command::Flush(reply)).await.ok()?;
            rx.await.ok()
        };

        match timeout(self.config.subscribe_timeout, drained).await {
            Ok(Some(())) => {}
            Ok(None) => log::debug!(target: "broker", "Broker closed before flushing"),
            Err(_) => log::warn!(target: "broker", "Timed out flushing pending events"),
        }
    }

    /// Number of live subscriptions across all topics; zero after shutdown.
    pub async fn subscription_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Count(reply)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

struct Dispatcher {
    topics: HashMap<Topic, Vec<Entry>>,
    next_id: u64,
    cancel: CancellationToken,
    config: BrokerConfig,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Subscribe { topic, reply } => {
                    let (tx, rx) = mpsc::channel(self.config.subscription_buffer);
                    let id = SubscriptionId(self.next_id);
                    self.next_id += 1;
                    self.topics.entry(topic).or_default().push(Entry { id, tx });
                    if reply.send(Subscription { id, topic, rx }).is_err() {
                        // Subscriber gave up waiting; forget it again.
                        self.remove(id);
                    }
                }
                Command::Unsubscribe { id, reply } => {
                    let removed = self.remove(id);
                    let _ = reply.send(removed);
                }
                Command::Publish(event) => self.dispatch(event).await,
                Command::Count(reply) => {
                    let _ = reply.send(self.topics.values().map(Vec::len).sum());
                }
                Command::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }

        let closed: usize = self.topics.values().map(Vec::len).sum();
        self.topics.clear();
        log::debug!(target: "broker", "Broker stopped, closed {} subscriptions", closed);
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        for entries in self.topics.values_mut() {
            if let Some(pos) = entries.iter().position(|entry| entry.id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    async fn dispatch(&mut self, event: Event) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut hung = false;
        for topic in event.topics() {
            let Some(entries) = self.topics.get_mut(topic) else {
                continue;
            };

            let mut gone = Vec::new();
            for entry in entries.iter() {
                let delivery = timeout(self.config.publish_timeout, entry.tx.send(event.clone()));
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled(), if !hung => return,
                    res = delivery => match res {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => gone.push(entry.id),
                        Err(_) => {
                            log::error!(
                                target: "broker",
                                "Broker is hung on write to subscription {} of {} topic",
                                entry.id,
                                topic
                            );
                            hung = true;
                            self.cancel.cancel();
                        }
                    },
                }
            }

            entries.retain(|entry| !gone.contains(&entry.id));
        }
    }
}
