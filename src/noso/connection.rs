use crate::noso::{
    broker::{Broker, Subscription},
    error::MinerError,
    protocol::{self, Request},
    Cycle,
};
use socket2::SockRef;
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Timeouts and intervals for one pool connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Limit on establishing the TCP connection
    pub dial_timeout: Duration,
    /// Limit on receiving JOINOK after JOIN is sent
    pub join_timeout: Duration,
    /// Read idle limit and watchdog window for PONG
    pub connection_timeout: Duration,
    /// Interval between PINGs once joined
    pub ping_interval: Duration,
    /// Pause before the next connection cycle
    pub reconnect_interval: Duration,
    /// Whether to enable TCP keepalive
    pub keepalive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(20),
            ping_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            keepalive: true,
        }
    }
}

/// Prefix every outbound command carries
#[derive(Debug, Clone)]
pub struct Credentials {
    pub password: String,
    pub wallet: String,
}

pub async fn dial(address: &str, config: &ClientConfig) -> Result<TcpStream, MinerError> {
    let stream = timeout(config.dial_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            MinerError::Connection(format!(
                "Timed out connecting to {} after {:?}",
                address, config.dial_timeout
            ))
        })?
        .map_err(|e| MinerError::Connection(format!("Failed to connect to {} - {}", address, e)))?;

    stream
        .set_nodelay(true)
        .map_err(|e| MinerError::Connection(format!("Failed to set nodelay - {}", e)))?;

    if config.keepalive {
        SockRef::from(&stream)
            .set_keepalive(true)
            .map_err(|e| MinerError::Connection(format!("Failed to set keepalive - {}", e)))?;
    }

    Ok(stream)
}

/// Writes queued requests to the pool until the queue closes, a write fails,
/// or the cycle is cancelled.
pub async fn send_loop<W>(
    mut writer: W,
    mut requests: mpsc::Receiver<Request>,
    credentials: Credentials,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let line = request.to_line(&credentials.password, &credentials.wallet);
        log::debug!(target: "client", "-> {}", line.trim_end());
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            log::warn!(target: "client", "Failed to write to pool: {}", err);
            break;
        }
    }

    let _ = writer.shutdown().await;
    cancel.cancel();
}

/// Reads pool lines and publishes each parsed event on the broker.
///
/// Any line, even one that fails to parse or is not valid UTF-8, resets the
/// idle deadline. Events read before the pool hung up are delivered before
/// the cycle is cancelled.
pub async fn receive_loop<R>(
    reader: R,
    broker: Broker,
    idle_timeout: Duration,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = timeout(idle_timeout, reader.read_until(b'\n', &mut buf)) => next,
        };

        match next {
            Ok(Ok(0)) => {
                log::info!(target: "client", "Pool closed the connection");
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                log::warn!(target: "client", "Failed to read from pool: {}", err);
                break;
            }
            Err(_) => {
                log::warn!(target: "client", "Nothing received from pool in {:?}", idle_timeout);
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        log::debug!(target: "client", "<- {}", line);
        match protocol::parse(line) {
            Ok(event) => broker.publish(event).await,
            Err(MinerError::EmptyMessage) => {}
            Err(err) => log::warn!(target: "client", "Dropping pool message: {}", err),
        }
    }

    broker.flush().await;
    cancel.cancel();
}

/// Sends a PING carrying the current hash rate every `every`.
pub async fn ping_loop(cycle: Cycle, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cycle.cancel.cancelled() => return,
            _ = ticker.tick() => cycle.send(Request::ping(cycle.hash_rate())).await,
        }
    }
}

/// Cancels the cycle when no PONG arrives within `window`.
pub async fn watchdog(mut pongs: Subscription, window: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            pong = timeout(window, pongs.recv()) => match pong {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => {
                    log::warn!(target: "client", "No PONG from pool in {:?}, reconnecting", window);
                    cancel.cancel();
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noso::types::{Event, Topic};
    use std::sync::{atomic::AtomicU64, Arc};
    use tokio_test::io::Builder;

    const PONG_LINE: &[u8] =
        b"PONG PoolData 37892 C74B9ABA60E2EE1B52613959D4F06876 11 0 105 0 -29 86070 3\n";

    #[tokio::test]
    async fn test_receive_loop_publishes_parsed_lines() {
        let cancel = CancellationToken::new();
        let broker = Broker::new(cancel.clone());
        let mut pool_data = broker.subscribe(Topic::PoolData).await.unwrap();
        let mut pings = broker.subscribe(Topic::PingPong).await.unwrap();

        let reader = Builder::new()
            .read(b"GARBAGE line\n")
            .read(b"\n")
            .read(PONG_LINE)
            .build();

        receive_loop(reader, broker.clone(), Duration::from_secs(1), cancel.clone()).await;

        assert!(matches!(pool_data.recv().await, Some(Event::Pong(_))));
        assert!(matches!(pings.recv().await, Some(Event::Pong(_))));
        // EOF ends the cycle
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_receive_loop_skips_invalid_utf8() {
        let cancel = CancellationToken::new();
        let broker = Broker::new(cancel.clone());
        let mut pings = broker.subscribe(Topic::PingPong).await.unwrap();

        let reader = Builder::new()
            .read(b"\xff\xfe garbage\n")
            .read(PONG_LINE)
            .build();

        receive_loop(reader, broker.clone(), Duration::from_secs(1), cancel.clone()).await;

        assert!(matches!(pings.recv().await, Some(Event::Pong(_))));
    }

    #[tokio::test]
    async fn test_receive_loop_delivers_last_line_before_cancel() {
        let cancel = CancellationToken::new();
        let broker = Broker::new(cancel.clone());
        let mut joins = broker.subscribe(Topic::Join).await.unwrap();

        let reader = Builder::new().read(b"ALREADYCONNECTED\n").build();
        receive_loop(reader, broker.clone(), Duration::from_secs(1), cancel.clone()).await;

        assert!(cancel.is_cancelled());
        assert!(matches!(joins.recv().await, Some(Event::AlreadyConnected)));
        assert!(joins.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_receive_loop_idle_timeout_cancels() {
        let cancel = CancellationToken::new();
        let broker = Broker::new(cancel.clone());

        let reader = Builder::new().wait(Duration::from_millis(500)).build();
        receive_loop(reader, broker, Duration::from_millis(50), cancel.clone()).await;

        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_loop_prefixes_credentials() {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        let writer = Builder::new()
            .write(b"secret Nwallet JOIN rn0.1.0\n")
            .write(b"secret Nwallet PING 12\n")
            .build();

        tx.send(Request::join("rn0.1.0")).await.unwrap();
        tx.send(Request::ping(12_345)).await.unwrap();
        drop(tx);

        let credentials = Credentials {
            password: "secret".into(),
            wallet: "Nwallet".into(),
        };
        send_loop(writer, rx, credentials, cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_watchdog_fires_without_pong() {
        let cancel = CancellationToken::new();
        let broker = Broker::new(cancel.clone());
        let pongs = broker.subscribe(Topic::PingPong).await.unwrap();

        watchdog(pongs, Duration::from_millis(50), cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_ping_loop_reports_hash_rate() {
        let root = CancellationToken::new();
        let (cycle, mut requests) = Cycle::new(&root, "wallet", Arc::new(AtomicU64::new(0)));
        cycle.set_hash_rate(2_500_000);

        cycle
            .tracker
            .spawn(ping_loop(cycle.clone(), Duration::from_millis(20)));

        let request = timeout(Duration::from_secs(1), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.to_string(), "PING 2500");

        cycle.shutdown().await;
    }
}
