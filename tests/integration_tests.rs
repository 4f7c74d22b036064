use std::error::Error;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    task::JoinHandle,
    time::{timeout, Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use rust_noso::noso::{
    self,
    client::Client,
    connection::ClientConfig,
    error::MinerError,
    jobs::JobManager,
    miner::MinerPool,
    options::Options,
    solution::SolutionManager,
    types::ConnectionState,
    MINER_NAME,
};

const JOINOK: &str = "JOINOK N6VxgLSpbni8kLbyUAjYXdHCPt2VEp 3p0000000 PoolData 37873 5A552449A9B72943989AFC35C2641D7A 10 0 95 0 -30 42270 2\n";

struct PoolSide {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl PoolSide {
    async fn read_line(&mut self) -> Result<String, Box<dyn Error>> {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await??;
        Ok(line.trim_end().to_string())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), Box<dyn Error>> {
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

async fn setup_test_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    println!("Test pool listening on port {}", addr.port());
    (listener, addr.to_string())
}

async fn accept(listener: &TcpListener) -> Result<PoolSide, Box<dyn Error>> {
    let (socket, _) = timeout(Duration::from_secs(5), listener.accept()).await??;
    let (read_half, writer) = socket.into_split();
    Ok(PoolSide {
        reader: BufReader::new(read_half),
        writer,
    })
}

fn test_config() -> ClientConfig {
    ClientConfig {
        dial_timeout: Duration::from_secs(1),
        join_timeout: Duration::from_secs(2),
        connection_timeout: Duration::from_secs(5),
        ping_interval: Duration::from_secs(5),
        reconnect_interval: Duration::from_millis(100),
        keepalive: true,
    }
}

fn spawn_client(client: Client) -> (Arc<Client>, JoinHandle<Result<(), MinerError>>) {
    let client = Arc::new(client);
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    (client, runner)
}

#[tokio::test]
async fn test_full_mining_cycle() -> Result<(), Box<dyn Error>> {
    let (listener, addr) = setup_test_server().await;
    let cancel = CancellationToken::new();

    let client = Client::new(
        addr,
        "pw",
        vec!["W1".into()],
        test_config(),
        cancel.clone(),
    )
    .service(JobManager::new("11").with_seed_chars("0"))
    .service(SolutionManager::new(false))
    .service(MinerPool::new(1).with_leading_chars(1));
    let (client, runner) = spawn_client(client);
    let mut state = client.state();

    let mut pool = accept(&listener).await?;
    assert_eq!(pool.read_line().await?, format!("pw W1 JOIN {}", MINER_NAME));
    pool.write_line(JOINOK).await?;
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ConnectionState::Joined),
    )
    .await??;

    // seed 3p0000000 + pool address + 11001 + "0000" hashes to 5a552449a9...
    let step = loop {
        let line = pool.read_line().await?;
        if line.contains(" STEP ") {
            break line;
        }
    };
    assert_eq!(step, "pw W1 STEP 37873 3p0000000 110010000 10");

    cancel.cancel();
    timeout(Duration::from_secs(30), runner).await???;
    assert_eq!(*client.state().borrow(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_already_connected_reconnects_immediately() -> Result<(), Box<dyn Error>> {
    let (listener, addr) = setup_test_server().await;
    let cancel = CancellationToken::new();
    let config = ClientConfig {
        reconnect_interval: Duration::from_secs(30),
        ..test_config()
    };
    let (_client, runner) = spawn_client(Client::new(
        addr,
        "pw",
        vec!["W1".into()],
        config,
        cancel.clone(),
    ));

    let mut first = accept(&listener).await?;
    first.read_line().await?;
    first.write_line("ALREADYCONNECTED\n").await?;
    let rejected_at = Instant::now();

    let mut second = accept(&listener).await?;
    assert!(second.read_line().await?.ends_with(&format!("JOIN {}", MINER_NAME)));
    let waited = rejected_at.elapsed();
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(5));

    cancel.cancel();
    timeout(Duration::from_secs(5), runner).await???;
    Ok(())
}

#[tokio::test]
async fn test_already_connected_then_close_reconnects_immediately() -> Result<(), Box<dyn Error>> {
    let (listener, addr) = setup_test_server().await;
    let cancel = CancellationToken::new();
    let config = ClientConfig {
        reconnect_interval: Duration::from_secs(30),
        ..test_config()
    };
    let (_client, runner) = spawn_client(Client::new(
        addr,
        "pw",
        vec!["W1".into()],
        config,
        cancel.clone(),
    ));

    // Reject and hang up straight away.
    let mut first = accept(&listener).await?;
    first.read_line().await?;
    first.write_line("ALREADYCONNECTED\n").await?;
    drop(first);
    let rejected_at = Instant::now();

    let mut second = accept(&listener).await?;
    assert!(second.read_line().await?.contains(" JOIN "));
    assert!(rejected_at.elapsed() < Duration::from_secs(5));

    cancel.cancel();
    timeout(Duration::from_secs(5), runner).await???;
    Ok(())
}

#[tokio::test]
async fn test_wallet_rotation_on_reconnect() -> Result<(), Box<dyn Error>> {
    let (listener, addr) = setup_test_server().await;
    let cancel = CancellationToken::new();
    let (_client, runner) = spawn_client(Client::new(
        addr,
        "pw",
        vec!["A".into(), "B".into()],
        test_config(),
        cancel.clone(),
    ));

    let mut wallets = Vec::new();
    for _ in 0..3 {
        let mut pool = accept(&listener).await?;
        let join = pool.read_line().await?;
        wallets.push(join.split_whitespace().nth(1).unwrap_or_default().to_string());
        // Dropping the socket ends the cycle.
    }
    assert_eq!(wallets, vec!["A", "B", "A"]);

    cancel.cancel();
    timeout(Duration::from_secs(5), runner).await???;
    Ok(())
}

#[tokio::test]
async fn test_join_timeout_triggers_reconnect() -> Result<(), Box<dyn Error>> {
    let (listener, addr) = setup_test_server().await;
    let cancel = CancellationToken::new();
    let config = ClientConfig {
        join_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (_client, runner) = spawn_client(Client::new(
        addr,
        "pw",
        vec!["W1".into()],
        config,
        cancel.clone(),
    ));

    // Stay silent after JOIN.
    let mut silent = accept(&listener).await?;
    silent.read_line().await?;

    let mut second = accept(&listener).await?;
    assert!(second.read_line().await?.contains(" JOIN "));
    drop(silent);

    cancel.cancel();
    timeout(Duration::from_secs(5), runner).await???;
    Ok(())
}

#[tokio::test]
async fn test_ping_and_watchdog() -> Result<(), Box<dyn Error>> {
    let (listener, addr) = setup_test_server().await;
    let cancel = CancellationToken::new();
    let config = ClientConfig {
        ping_interval: Duration::from_millis(50),
        connection_timeout: Duration::from_millis(500),
        ..test_config()
    };
    let (client, runner) = spawn_client(Client::new(
        addr,
        "pw",
        vec!["W1".into()],
        config,
        cancel.clone(),
    ));
    let mut state = client.state();

    let mut pool = accept(&listener).await?;
    pool.read_line().await?;
    pool.write_line(JOINOK).await?;
    timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ConnectionState::Joined),
    )
    .await??;

    assert_eq!(pool.read_line().await?, "pw W1 PING 0");
    pool.write_line("PONG PoolData 37873 5A552449A9B72943989AFC35C2641D7A 10 0 95 0 -30 42270 2\n")
        .await?;
    assert_eq!(pool.read_line().await?, "pw W1 PING 0");

    // No more PONGs: the watchdog drops the connection and the client dials again.
    let mut second = accept(&listener).await?;
    assert!(second.read_line().await?.contains(" JOIN "));

    cancel.cancel();
    timeout(Duration::from_secs(5), runner).await???;
    Ok(())
}

#[tokio::test]
async fn test_exit_on_retry() -> Result<(), Box<dyn Error>> {
    let (listener, addr) = setup_test_server().await;
    let (host, port) = addr.rsplit_once(':').unwrap();
    let dir = TempDir::new()?;
    let payments = dir.path().join("payments.csv");

    let options = Options {
        address: host.to_string(),
        port: port.parse()?,
        password: "pw".into(),
        wallets: vec!["W1".into()],
        cpu: 1,
        status_interval: 60,
        show_pop: false,
        exit_on_retry: true,
        payments_file: payments,
    };

    let shutdown = CancellationToken::new();
    let miner = tokio::spawn(noso::run(options, shutdown.clone()));

    let mut pool = accept(&listener).await?;
    pool.read_line().await?;
    drop(pool);

    let result = timeout(Duration::from_secs(10), miner).await??;
    assert!(matches!(result, Err(MinerError::Connection(_))));
    assert!(shutdown.is_cancelled());

    Ok(())
}
