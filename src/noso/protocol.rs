use crate::noso::{
    error::MinerError,
    types::{Event, JoinOk, PaymentOk, PoolData, Solution, StepOk},
};
use std::fmt;
use std::str::FromStr;

/// Inbound message keywords
pub const JOINOK: &str = "JOINOK";
pub const PASSFAILED: &str = "PASSFAILED";
pub const ALREADYCONNECTED: &str = "ALREADYCONNECTED";
pub const PONG: &str = "PONG";
pub const POOLSTEPS: &str = "POOLSTEPS";
pub const STEPOK: &str = "STEPOK";
pub const PAYMENTOK: &str = "PAYMENTOK";

/// Marker token preceding the pool data block
pub const POOL_DATA: &str = "PoolData";

/// Outbound command keywords
pub const JOIN: &str = "JOIN";
pub const PING: &str = "PING";
pub const STEP: &str = "STEP";
pub const PAYMENT: &str = "PAYMENT";

/// Parses one line received from the pool into a typed event.
pub fn parse(line: &str) -> Result<Event, MinerError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let Some(&keyword) = fields.first() else {
        return Err(MinerError::EmptyMessage);
    };

    match keyword {
        JOINOK => {
            if fields.len() < 13 {
                return Err(malformed(line, "expected 13 fields"));
            }
            Ok(Event::JoinOk(JoinOk {
                pool_addr: fields[1].to_string(),
                miner_seed: fields[2].to_string(),
                pool_data: parse_pool_data(line, &fields[3..])?,
            }))
        }
        PASSFAILED => Ok(Event::PassFailed),
        ALREADYCONNECTED => Ok(Event::AlreadyConnected),
        PONG => Ok(Event::Pong(parse_pool_data(line, &fields[1..])?)),
        POOLSTEPS => Ok(Event::PoolSteps(parse_pool_data(line, &fields[1..])?)),
        STEPOK => {
            let pop_value = match fields.get(1) {
                Some(value) => Some(number(line, value, "pop value")?),
                None => None,
            };
            Ok(Event::StepOk(StepOk { pop_value }))
        }
        PAYMENTOK => {
            if fields.len() < 8 {
                return Err(malformed(line, "expected 8 fields"));
            }
            Ok(Event::PaymentOk(PaymentOk {
                timestamp: number(line, fields[1], "timestamp")?,
                pool_ip: fields[2].to_string(),
                wallet: fields[3].to_string(),
                block: number(line, fields[5], "block")?,
                amount: fields[6].to_string(),
                order_id: fields[7].to_string(),
            }))
        }
        _ => Err(MinerError::UnknownMessage(line.trim().to_string())),
    }
}

/// Parses `PoolData <block> <target> <chars> <step> <diff> <balance> <btp> <hashrate> <depth>`.
fn parse_pool_data(line: &str, fields: &[&str]) -> Result<PoolData, MinerError> {
    if fields.len() < 10 {
        return Err(malformed(line, "pool data needs 10 fields"));
    }
    if fields[0] != POOL_DATA {
        return Err(malformed(line, "missing PoolData marker"));
    }

    Ok(PoolData {
        block: number(line, fields[1], "block")?,
        target_hash: fields[2].to_string(),
        target_chars: number(line, fields[3], "target chars")?,
        step: number(line, fields[4], "step")?,
        difficulty: number(line, fields[5], "difficulty")?,
        pool_balance: fields[6].to_string(),
        blocks_till_payment: number(line, fields[7], "blocks till payment")?,
        pool_hashrate: number(line, fields[8], "pool hashrate")?,
        pool_depth: number(line, fields[9], "pool depth")?,
    })
}

fn number<T: FromStr>(line: &str, field: &str, name: &str) -> Result<T, MinerError> {
    field
        .parse()
        .map_err(|_| malformed(line, &format!("invalid {}: {}", name, field)))
}

fn malformed(line: &str, reason: &str) -> MinerError {
    MinerError::Malformed(format!("{} ({})", line.trim(), reason))
}

impl fmt::Display for PoolData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {} {} {}",
            POOL_DATA,
            self.block,
            self.target_hash,
            self.target_chars,
            self.step,
            self.difficulty,
            self.pool_balance,
            self.blocks_till_payment,
            self.pool_hashrate,
            self.pool_depth
        )
    }
}

impl fmt::Display for JoinOk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            JOINOK, self.pool_addr, self.miner_seed, self.pool_data
        )
    }
}

/// A command sent to the pool, without the password/wallet prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Join { miner_name: String },
    Ping { hash_rate_khs: u64 },
    Step {
        block: u64,
        seed: String,
        hash_str: String,
        target_len: usize,
    },
    Payment,
}

impl Request {
    pub fn join(miner_name: impl Into<String>) -> Self {
        Request::Join {
            miner_name: miner_name.into(),
        }
    }

    /// The pool expects the hash rate in kH/s.
    pub fn ping(hash_rate: u64) -> Self {
        Request::Ping {
            hash_rate_khs: hash_rate / 1000,
        }
    }

    pub fn step(solution: &Solution) -> Self {
        Request::Step {
            block: solution.block,
            seed: solution.seed.clone(),
            hash_str: solution.hash_str.clone(),
            target_len: solution.target_len,
        }
    }

    pub fn payment() -> Self {
        Request::Payment
    }

    /// Full wire line, authenticated and newline-terminated.
    pub fn to_line(&self, password: &str, wallet: &str) -> String {
        format!("{} {} {}\n", password, wallet, self)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Join { miner_name } => write!(f, "{} {}", JOIN, miner_name),
            Request::Ping { hash_rate_khs } => write!(f, "{} {}", PING, hash_rate_khs),
            Request::Step {
                block,
                seed,
                hash_str,
                target_len,
            } => write!(
                f,
                "{} {} {} {} {}",
                STEP, block, seed, hash_str, target_len
            ),
            Request::Payment => f.write_str(PAYMENT),
        }
    }
}
