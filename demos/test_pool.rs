use rand::{thread_rng, Rng};
use rust_noso::noso::types::{JoinOk, PoolData};
use std::{error::Error, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::Mutex,
    time::Duration,
};

const POOL_ADDR: &str = "N6VxgLSpbni8kLbyUAjYXdHCPt2VEp";

struct PoolSession {
    data: PoolData,
    password: String,
}

impl PoolSession {
    fn new(difficulty: u32, password: String) -> Self {
        Self {
            data: PoolData {
                block: 37873,
                target_hash: random_target(),
                target_chars: (difficulty / 10) as usize + 1,
                step: 0,
                difficulty,
                pool_balance: "0".into(),
                blocks_till_payment: -30,
                pool_hashrate: 42270,
                pool_depth: 3,
            },
            password,
        }
    }

    fn join_ok(&self) -> JoinOk {
        let mut rng = thread_rng();
        JoinOk {
            pool_addr: POOL_ADDR.into(),
            miner_seed: format!("{:02}0000000", rng.gen_range(0..100)),
            pool_data: self.data.clone(),
        }
    }

    fn next_block(&mut self) {
        self.data.block += 1;
        self.data.step = 0;
        self.data.target_hash = random_target();
        self.data.blocks_till_payment += 1;
    }
}

fn random_target() -> String {
    let mut rng = thread_rng();
    format!("{:016X}{:016X}", rng.gen::<u64>(), rng.gen::<u64>())
}

async fn write_line(writer: &Mutex<OwnedWriteHalf>, line: String) -> std::io::Result<()> {
    println!("-> {}", line);
    writer.lock().await.write_all(format!("{}\n", line).as_bytes()).await
}

async fn handle_miner(
    stream: TcpStream,
    difficulty: u32,
    password: String,
) -> Result<(), Box<dyn Error>> {
    let (reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut lines = BufReader::new(reader).lines();
    let session = Arc::new(Mutex::new(PoolSession::new(difficulty, password)));

    // New block every 30 seconds
    let session_clone = session.clone();
    let writer_clone = writer.clone();
    let blocks = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let line = {
                let mut session = session_clone.lock().await;
                session.next_block();
                format!("POOLSTEPS {}", session.data)
            };
            if write_line(&writer_clone, line).await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        println!("<- {}", line);
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }

        let mut session = session.lock().await;
        if fields[0] != session.password {
            write_line(&writer, "PASSFAILED".into()).await?;
            continue;
        }

        let response = match fields[2] {
            "JOIN" => session.join_ok().to_string(),
            "PING" => format!("PONG {}", session.data),
            "STEP" => {
                session.data.step += 1;
                session.data.pool_balance = format!("{}", session.data.step as u64 * 1_500);
                "STEPOK 10".to_string()
            }
            "PAYMENT" => format!(
                "PAYMENTOK {} 127.0.0.1 {} 2 {} {} OR{:016x}",
                chrono::Utc::now().timestamp(),
                fields[1],
                session.data.block,
                session.data.pool_balance,
                thread_rng().gen::<u64>()
            ),
            _ => continue,
        };
        drop(session);
        write_line(&writer, response).await?;
    }

    blocks.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let addr = "127.0.0.1:8082";
    let difficulty = std::env::var("DIFFICULTY")
        .ok()
        .and_then(|d| d.parse::<u32>().ok())
        .unwrap_or(85);
    let password = std::env::var("POOL_PASSWORD").unwrap_or_else(|_| "secret".into());

    println!("Starting test Noso pool on {} with difficulty {}", addr, difficulty);
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (socket, peer) = listener.accept().await?;
        println!("New miner from {}", peer);

        let password = password.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_miner(socket, difficulty, password).await {
                eprintln!("Miner error: {}", e);
            }
        });
    }
}
