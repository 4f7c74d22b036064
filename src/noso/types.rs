use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Broker topics. An event may be routed to more than one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    Join,
    PingPong,
    PoolData,
    PoolSteps,
    Solution,
    Job,
    StepOk,
    HashRate,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::Join => "Join",
            Topic::PingPong => "PingPong",
            Topic::PoolData => "PoolData",
            Topic::PoolSteps => "PoolSteps",
            Topic::Solution => "Solution",
            Topic::Job => "Job",
            Topic::StepOk => "StepOk",
            Topic::HashRate => "HashRate",
        };
        f.write_str(name)
    }
}

/// The pool state block shared by JOINOK, PONG and POOLSTEPS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolData {
    pub block: u64,
    pub target_hash: String,
    pub target_chars: usize,
    pub step: u32,
    pub difficulty: u32,
    /// Raw balance in the smallest unit, kept as sent by the pool.
    pub pool_balance: String,
    pub blocks_till_payment: i64,
    pub pool_hashrate: u64,
    pub pool_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOk {
    pub pool_addr: String,
    pub miner_seed: String,
    pub pool_data: PoolData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOk {
    pub pop_value: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOk {
    pub timestamp: i64,
    pub pool_ip: String,
    pub wallet: String,
    pub block: u64,
    pub amount: String,
    pub order_id: String,
}

/// A bounded unit of search work.
///
/// `miner_seed` is always `miner_seed_base + pool_addr + miner_postfix`, and
/// `cancel` belongs to the block scope the job was built in.
#[derive(Debug, Clone)]
pub struct Job {
    pub pool_addr: String,
    pub miner_seed_base: String,
    pub miner_postfix: String,
    pub miner_seed: String,
    pub target_string: String,
    pub target_chars: usize,
    pub difficulty: u32,
    pub block: u64,
    pub step: u32,
    pub pool_depth: usize,
    pub cancel: CancellationToken,
}

impl Job {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A candidate proof found by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    pub block: u64,
    pub seed: String,
    pub hash_str: String,
    pub target_len: usize,
    pub target_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashRateReport {
    pub worker: usize,
    pub hashes: u64,
    pub elapsed: Duration,
}

impl HashRateReport {
    /// Hashes per second over the sampled interval.
    pub fn hash_rate(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.hashes as f64 / secs) as u64
    }
}

/// Published after a STEP command has been queued for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSent {
    pub block: u64,
    pub pop: bool,
}

/// Blocking receive side of the rendezvous job stream.
pub type JobStream = crossbeam_channel::Receiver<Job>;

/// Asks the job builder for a handle on its job stream.
#[derive(Debug, Clone)]
pub struct JobStreamRequest {
    pub reply: mpsc::Sender<JobStream>,
}

#[derive(Debug, Clone)]
pub enum Event {
    JoinOk(JoinOk),
    PassFailed,
    AlreadyConnected,
    Pong(PoolData),
    PoolSteps(PoolData),
    StepOk(StepOk),
    PaymentOk(PaymentOk),
    Solution(Solution),
    /// Asks the job manager for the rendezvous job stream.
    JobStreamRequest(JobStreamRequest),
    HashRate(HashRateReport),
    StepSent(StepSent),
}

impl Event {
    /// Topics this event is delivered to.
    pub fn topics(&self) -> &'static [Topic] {
        match self {
            Event::JoinOk(_) => &[Topic::Join, Topic::PoolData],
            Event::PassFailed | Event::AlreadyConnected => &[Topic::Join],
            Event::Pong(_) => &[Topic::PingPong, Topic::PoolData],
            Event::PoolSteps(_) => &[Topic::PoolSteps, Topic::PoolData],
            Event::PaymentOk(_) => &[Topic::PoolData],
            Event::StepOk(_) | Event::StepSent(_) => &[Topic::StepOk],
            Event::Solution(_) => &[Topic::Solution],
            Event::JobStreamRequest(_) => &[Topic::Job],
            Event::HashRate(_) => &[Topic::HashRate],
        }
    }

    /// The pool data carried by JOINOK, PONG and POOLSTEPS.
    pub fn pool_data(&self) -> Option<&PoolData> {
        match self {
            Event::JoinOk(join) => Some(&join.pool_data),
            Event::Pong(data) | Event::PoolSteps(data) => Some(data),
            _ => None,
        }
    }
}

/// Client connection lifecycle, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Joining,
    Joined,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Joining => write!(f, "joining"),
            ConnectionState::Joined => write!(f, "joined"),
        }
    }
}
