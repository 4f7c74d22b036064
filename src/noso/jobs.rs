use crate::noso::{
    broker::Subscription,
    error::MinerError,
    types::{Event, Job, JobStream, JobStreamRequest, PoolData, Topic},
    Cycle, CycleService,
};
use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender};
use rand::{seq::SliceRandom, thread_rng};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Characters the pool accepts in a miner seed. `%`, `(` and `_` are
/// reserved.
pub const HASHABLE_SEED_CHARS: &str =
    "!\"#$&')*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^`abcdefghijklmnopqrstuvwxyz{|";

/// Postfix counter range per seed: `001` through `998`.
const POSTFIX_RANGE: std::ops::Range<u32> = 1..999;

/// How long a job stream request may wait for its reply to be accepted.
const REPLY_TIMEOUT: Duration = Duration::from_millis(100);

/// What the enumerator needs to build jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolState {
    pool_addr: String,
    miner_seed: String,
    data: PoolData,
}

#[derive(Debug)]
enum Control {
    /// First JOINOK of the cycle; enumeration may start.
    Ready(PoolState),
    /// Same block, refreshed pool data.
    Update(PoolState),
    /// Block changed; cancel outstanding jobs and restart the seed space.
    NewBlock(PoolState),
}

/// Builds jobs for the workers of each connection cycle.
///
/// The enumerator runs on a blocking thread and offers jobs on a rendezvous
/// channel, so no job exists until a worker is ready to take it. The async
/// side tracks pool data from the broker and hands out the stream to workers
/// that ask for it.
pub struct JobManager {
    version_tag: String,
    seed_chars: Vec<u8>,
}

impl JobManager {
    pub fn new(version_tag: impl Into<String>) -> Self {
        Self {
            version_tag: version_tag.into(),
            seed_chars: HASHABLE_SEED_CHARS.as_bytes().to_vec(),
        }
    }

    /// Restricts the characters used for the 3-character seed suffix.
    pub fn with_seed_chars(mut self, chars: &str) -> Self {
        self.seed_chars = chars.as_bytes().to_vec();
        self
    }
}

#[async_trait]
impl CycleService for JobManager {
    async fn start(&self, cycle: &Cycle) -> Result<(), MinerError> {
        if self.seed_chars.is_empty() {
            return Err(MinerError::Config("seed charset is empty".into()));
        }

        let pool_data = cycle.broker.subscribe(Topic::PoolData).await?;
        let requests = cycle.broker.subscribe(Topic::Job).await?;

        let (job_tx, job_rx) = crossbeam_channel::bounded(0);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let enumerator = Enumerator {
            version_tag: self.version_tag.clone(),
            seed_chars: self.seed_chars.clone(),
            jobs: job_tx,
            control: control_rx,
            cancel: cycle.cancel.clone(),
        };
        cycle.tracker.spawn_blocking(move || enumerator.run());

        let coordinator = Coordinator {
            control: control_tx,
            jobs: job_rx,
            current: None,
        };
        cycle
            .tracker
            .spawn(coordinator.run(pool_data, requests, cycle.cancel.clone()));

        Ok(())
    }
}

struct Coordinator {
    control: Sender<Control>,
    jobs: JobStream,
    current: Option<PoolState>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut pool_data: Subscription,
        mut requests: Subscription,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = pool_data.recv() => match event {
                    Some(event) => self.on_pool_event(event),
                    None => break,
                },
                event = requests.recv() => match event {
                    Some(Event::JobStreamRequest(request)) => self.answer(request).await,
                    Some(_) => {}
                    None => break,
                },
            }
        }
        // Dropping the control sender stops the enumerator.
    }

    fn on_pool_event(&mut self, event: Event) {
        let next = match (event, &self.current) {
            (Event::JoinOk(join), _) => PoolState {
                pool_addr: join.pool_addr,
                miner_seed: join.miner_seed,
                data: join.pool_data,
            },
            (Event::PoolSteps(data), Some(current)) => PoolState {
                data,
                ..current.clone()
            },
            // Steps before JOINOK carry no seed to build from; PONG does not
            // move jobs along.
            _ => return,
        };

        let control = match &self.current {
            None => Control::Ready(next.clone()),
            Some(current) if current.data.block != next.data.block => {
                log::info!(
                    target: "jobs",
                    "New block {} (was {}), restarting jobs",
                    next.data.block,
                    current.data.block
                );
                Control::NewBlock(next.clone())
            }
            Some(current) if *current == next => return,
            Some(_) => Control::Update(next.clone()),
        };

        self.current = Some(next);
        if self.control.send(control).is_err() {
            log::debug!(target: "jobs", "Job enumerator already stopped");
        }
    }

    async fn answer(&self, request: JobStreamRequest) {
        match timeout(REPLY_TIMEOUT, request.reply.send(self.jobs.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => log::warn!(target: "jobs", "Job stream requester went away"),
            Err(_) => log::warn!(target: "jobs", "Timed out replying to a job stream request"),
        }
    }
}

enum Step {
    Sent,
    Control(Control),
    Stop,
}

struct Enumerator {
    version_tag: String,
    seed_chars: Vec<u8>,
    jobs: Sender<Job>,
    control: Receiver<Control>,
    cancel: CancellationToken,
}

impl Enumerator {
    fn run(self) {
        let mut state = match self.control.recv() {
            Ok(Control::Ready(state) | Control::Update(state) | Control::NewBlock(state)) => state,
            Err(_) => return,
        };

        loop {
            let scope = self.cancel.child_token();
            let restart = self.enumerate_block(&mut state, &scope);
            scope.cancel();
            if !restart {
                return;
            }
        }
    }

    /// Offers jobs for one block until the block changes (`true`) or the
    /// cycle ends (`false`).
    fn enumerate_block(&self, state: &mut PoolState, scope: &CancellationToken) -> bool {
        let mut order = self.seed_chars.clone();
        order.shuffle(&mut thread_rng());
        let base = seed_base(&state.miner_seed).to_string();

        log::debug!(
            target: "jobs",
            "Enumerating block {} from seed base {}",
            state.data.block,
            base
        );

        loop {
            for &x in &order {
                for &y in &order {
                    for &z in &order {
                        let seed = format!("{}{}{}{}", base, x as char, y as char, z as char);
                        for num in POSTFIX_RANGE {
                            let postfix = format!("{}{:03}", self.version_tag, num);
                            match self.offer(state, &seed, &postfix, scope) {
                                Some(true) => {}
                                Some(false) => return true,
                                None => return false,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Blocks until a worker takes the job. Returns `Some(false)` on a new
    /// block and `None` once the cycle is over.
    fn offer(
        &self,
        state: &mut PoolState,
        seed: &str,
        postfix: &str,
        scope: &CancellationToken,
    ) -> Option<bool> {
        loop {
            let job = build_job(state, seed, postfix, scope);
            let step = crossbeam_channel::select! {
                send(self.jobs, job) -> res => match res {
                    Ok(()) => Step::Sent,
                    Err(_) => Step::Stop,
                },
                recv(self.control) -> msg => match msg {
                    Ok(control) => Step::Control(control),
                    Err(_) => Step::Stop,
                },
            };

            match step {
                Step::Sent => return Some(true),
                Step::Stop => return None,
                Step::Control(Control::NewBlock(next)) => {
                    *state = next;
                    return Some(false);
                }
                // Rebuild the same position with the refreshed data.
                Step::Control(Control::Ready(next) | Control::Update(next)) => *state = next,
            }
        }
    }
}

fn build_job(state: &PoolState, seed: &str, postfix: &str, scope: &CancellationToken) -> Job {
    Job {
        pool_addr: state.pool_addr.clone(),
        miner_seed_base: seed.to_string(),
        miner_postfix: postfix.to_string(),
        miner_seed: format!("{}{}{}", seed, state.pool_addr, postfix),
        target_string: state.data.target_hash.clone(),
        target_chars: state.data.target_chars,
        difficulty: state.data.difficulty,
        block: state.data.block,
        step: state.data.step,
        pool_depth: state.data.pool_depth,
        cancel: scope.clone(),
    }
}

/// The pool's miner seed without its last three characters.
fn seed_base(miner_seed: &str) -> &str {
    match miner_seed.char_indices().rev().nth(2) {
        Some((idx, _)) => &miner_seed[..idx],
        None => "",
    }
}
