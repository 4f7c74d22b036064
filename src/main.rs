use clap::Parser;
use rust_noso::noso::{self, options::Options};
use std::error::Error;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = Options::parse();
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!(target: "noso", "Shutting down");
                shutdown.cancel();
            }
        });
    }

    noso::run(options, shutdown).await?;
    Ok(())
}
