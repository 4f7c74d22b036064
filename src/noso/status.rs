use crate::noso::{
    broker::Subscription,
    error::MinerError,
    payments::{parse_amount, PaymentLog},
    protocol::Request,
    types::{Event, PoolData, Topic},
    Cycle, CycleService,
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::Mutex,
    time::{interval_at, Instant, MissedTickBehavior},
};

/// Minimum time between two PAYMENT requests.
pub const PAYMENT_INTERVAL: Duration = Duration::from_secs(10 * 60);

const MAGNITUDES: [&str; 8] = ["H", "Kh", "Mh", "Gh", "Th", "Ph", "Eh", "Zh"];

/// Formats a decimal hash rate string as `"%3s.%s <mag>ash/s"`.
pub fn format_hash_rate(hash_rate: &str) -> String {
    if hash_rate.is_empty() {
        return String::new();
    }

    let len = hash_rate.len();
    let mag = MAGNITUDES[((len - 1) / 3).min(MAGNITUDES.len() - 1)];
    let (whole, frac) = if len < 4 {
        (hash_rate, "000")
    } else {
        let split = match len % 3 {
            0 => 3,
            n => n,
        };
        (&hash_rate[..split], &hash_rate[split..split + 3])
    };

    format!("{:>3}.{} {}ash/s", whole, frac, mag)
}

pub fn format_balance(balance: &str) -> String {
    format!("{} Noso", parse_amount(balance))
}

/// A payment is due when the balance is non-zero, fully vested, and no
/// request went out within [`PAYMENT_INTERVAL`].
pub fn payment_due(data: &PoolData, last_request: Option<Instant>, now: Instant) -> bool {
    data.pool_balance != "0"
        && data.blocks_till_payment > 0
        && last_request.map_or(true, |last| now.duration_since(last) > PAYMENT_INTERVAL)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub wallet: String,
    pub block: u64,
    pub miner_hashrate: u64,
    pub pool_hashrate: u64,
    pub pool_balance: String,
    pub blocks_till_payment: i64,
    pub steps_sent: u64,
    pub pop_sent: u64,
    pub steps_accepted: u64,
    pub pop_earned: u64,
}

impl Stats {
    fn render(&self) -> String {
        let note = if self.blocks_till_payment > 0 {
            " (payment due when the pool finds a block)"
        } else {
            ""
        };
        format!(
            "\n************************************\n\
             Miner's Wallet Addr : {}\n\
             Current Block       : {}\n\
             Miner Hash Rate     : {}\n\
             Pool Hash Rate      : {}\n\
             Pool Balance        : {}\n\
             Blocks Till Payment : {}{}\n\
             Steps Sent          : {}\n\
             PoP Sent            : {}\n\
             Steps Accepted      : {} ({} PoP earned)\n\
             ************************************",
            self.wallet,
            self.block,
            format_hash_rate(&self.miner_hashrate.to_string()),
            // The pool reports its rate in kH/s.
            format_hash_rate(&format!("{}000", self.pool_hashrate)),
            format_balance(&self.pool_balance),
            self.blocks_till_payment,
            note,
            self.steps_sent,
            self.pop_sent,
            self.steps_accepted,
            self.pop_earned,
        )
    }
}

/// Periodically logs miner status and requests payouts.
///
/// Counters and the last payment request time survive reconnects.
pub struct StatusReporter {
    pool: String,
    interval: Duration,
    payments: PaymentLog,
    stats: Arc<Mutex<Stats>>,
    last_payment: Arc<Mutex<Option<Instant>>>,
}

impl StatusReporter {
    pub fn new(pool: impl Into<String>, interval: Duration, payments: PaymentLog) -> Self {
        Self {
            pool: pool.into(),
            interval,
            payments,
            stats: Arc::new(Mutex::new(Stats {
                pool_balance: "0".into(),
                ..Stats::default()
            })),
            last_payment: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn stats(&self) -> Stats {
        self.stats.lock().await.clone()
    }
}

#[async_trait]
impl CycleService for StatusReporter {
    async fn start(&self, cycle: &Cycle) -> Result<(), MinerError> {
        let pool_data = cycle.broker.subscribe(Topic::PoolData).await?;
        let steps = cycle.broker.subscribe(Topic::StepOk).await?;
        let hash_rates = cycle.broker.subscribe(Topic::HashRate).await?;

        self.stats.lock().await.wallet = cycle.wallet.clone();

        let task = Reporter {
            pool: self.pool.clone(),
            interval: self.interval,
            payments: self.payments.clone(),
            stats: self.stats.clone(),
            last_payment: self.last_payment.clone(),
            cycle: cycle.clone(),
        };
        cycle.tracker.spawn(task.run(pool_data, steps, hash_rates));
        Ok(())
    }
}

struct Reporter {
    pool: String,
    interval: Duration,
    payments: PaymentLog,
    stats: Arc<Mutex<Stats>>,
    last_payment: Arc<Mutex<Option<Instant>>>,
    cycle: Cycle,
}

impl Reporter {
    async fn run(
        self,
        mut pool_data: Subscription,
        mut steps: Subscription,
        mut hash_rates: Subscription,
    ) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cycle.cancel.cancelled() => break,
                event = pool_data.recv() => match event {
                    Some(event) => self.on_pool_event(event).await,
                    None => break,
                },
                event = steps.recv() => match event {
                    Some(Event::StepOk(ok)) => {
                        let mut stats = self.stats.lock().await;
                        stats.steps_accepted += 1;
                        stats.pop_earned += ok.pop_value.unwrap_or(0);
                    }
                    Some(Event::StepSent(sent)) => {
                        let mut stats = self.stats.lock().await;
                        if sent.pop {
                            stats.pop_sent += 1;
                        } else {
                            stats.steps_sent += 1;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                event = hash_rates.recv() => match event {
                    Some(Event::HashRate(_)) => {
                        self.stats.lock().await.miner_hashrate = self.cycle.hash_rate();
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = ticker.tick() => self.report().await,
            }
        }
    }

    async fn on_pool_event(&self, event: Event) {
        if let Event::PaymentOk(payment) = &event {
            log::info!(
                target: "status",
                "Pool paid {} to {} in block {} (order {})",
                format_balance(&payment.amount),
                payment.wallet,
                payment.block,
                payment.order_id
            );
            if let Err(err) = self.payments.log_response(payment).await {
                log::warn!(target: "status", "Failed to log payment: {}", err);
            }
            return;
        }

        let Some(data) = event.pool_data() else {
            return;
        };

        {
            let mut stats = self.stats.lock().await;
            stats.block = data.block;
            stats.pool_hashrate = data.pool_hashrate;
            stats.pool_balance = data.pool_balance.clone();
            stats.blocks_till_payment = data.blocks_till_payment;
        }

        let mut last_payment = self.last_payment.lock().await;
        let now = Instant::now();
        if !payment_due(data, *last_payment, now) {
            return;
        }
        *last_payment = Some(now);
        drop(last_payment);

        log::info!(
            target: "status",
            "Requesting payment of {}",
            format_balance(&data.pool_balance)
        );
        self.cycle.send(Request::payment()).await;
        if let Err(err) = self
            .payments
            .log_request(&self.pool, &self.cycle.wallet, data.block, &data.pool_balance)
            .await
        {
            log::warn!(target: "status", "Failed to log payment request: {}", err);
        }
    }

    async fn report(&self) {
        let stats = self.stats.lock().await.clone();
        log::info!(target: "status", "{}", stats.render());
        match serde_json::to_string(&stats) {
            Ok(json) => log::debug!(target: "status", "{}", json),
            Err(err) => log::debug!(target: "status", "Failed to encode status: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noso::types::StepSent;
    use tempfile::TempDir;
    use std::sync::atomic::AtomicU64;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn data(balance: &str, blocks_till_payment: i64) -> PoolData {
        PoolData {
            block: 5833,
            target_hash: "C74B9ABA60E2EE1B52613959D4F06876".into(),
            target_chars: 11,
            step: 0,
            difficulty: 105,
            pool_balance: balance.into(),
            blocks_till_payment,
            pool_hashrate: 86070,
            pool_depth: 3,
        }
    }

    #[test]
    fn test_hash_rate_formatting() {
        let cases = [
            ("1", "  1.000 Hash/s"),
            ("12", " 12.000 Hash/s"),
            ("123", "123.000 Hash/s"),
            ("1234", "  1.234 Khash/s"),
            ("12345", " 12.345 Khash/s"),
            ("123456", "123.456 Khash/s"),
            ("1234560", "  1.234 Mhash/s"),
            ("12345600000", " 12.345 Ghash/s"),
            ("123456000000000", "123.456 Thash/s"),
            ("1234560000000000", "  1.234 Phash/s"),
            ("12345600000000000000", " 12.345 Ehash/s"),
            ("123456000000000000000000", "123.456 Zhash/s"),
        ];
        for (hash_rate, want) in cases {
            assert_eq!(format_hash_rate(hash_rate), want, "hash rate {}", hash_rate);
        }
        assert_eq!(format_hash_rate(""), "");
    }

    #[test]
    fn test_balance_formatting() {
        let cases = [
            ("0", "0.00000000 Noso"),
            ("1", "0.00000001 Noso"),
            ("4321", "0.00004321 Noso"),
            ("987654321", "9.87654321 Noso"),
            ("1987654321", "19.87654321 Noso"),
        ];
        for (balance, want) in cases {
            assert_eq!(format_balance(balance), want);
        }
    }

    #[test]
    fn test_payment_due() {
        let now = Instant::now();
        assert!(payment_due(&data("1500", 1), None, now));
        assert!(!payment_due(&data("0", 1), None, now));
        assert!(!payment_due(&data("1500", 0), None, now));
        assert!(!payment_due(&data("1500", -3), None, now));
        assert!(!payment_due(&data("1500", 1), Some(now), now));
        assert!(payment_due(
            &data("1500", 1),
            Some(now),
            now + PAYMENT_INTERVAL + Duration::from_secs(1)
        ));
    }

    #[tokio::test]
    async fn test_payment_requested_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payments.csv");
        let reporter = StatusReporter::new(
            "10.0.0.1",
            Duration::from_secs(60),
            PaymentLog::new(&path),
        );

        let root = CancellationToken::new();
        let (cycle, mut requests) = Cycle::new(&root, "Nwallet", Arc::new(AtomicU64::new(0)));
        reporter.start(&cycle).await.unwrap();

        cycle.broker.publish(Event::Pong(data("1500", 2))).await;
        cycle.broker.publish(Event::Pong(data("1500", 2))).await;
        cycle
            .broker
            .publish(Event::StepSent(StepSent {
                block: 5833,
                pop: false,
            }))
            .await;

        let request = timeout(Duration::from_secs(1), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request, Request::Payment);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(requests.try_recv().is_err());

        let stats = reporter.stats().await;
        assert_eq!(stats.wallet, "Nwallet");
        assert_eq!(stats.block, 5833);
        assert_eq!(stats.pool_balance, "1500");
        assert_eq!(stats.steps_sent, 1);

        cycle.shutdown().await;

        let csv = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(csv.contains(",10.0.0.1,Nwallet,Payment Request,5833,0.00001500,"));
    }
}
