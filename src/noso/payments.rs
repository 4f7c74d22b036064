use crate::noso::{error::MinerError, types::PaymentOk};
use chrono::{Local, SecondsFormat};
use std::path::{Path, PathBuf};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

pub const CSV_HEADER: &str = "Transaction Time,Pool IP Address,Wallet Address,Request Or Response,Block,Payment Amount,Order Id\n";

/// Append-only CSV record of payment requests and pool confirmations.
#[derive(Debug, Clone)]
pub struct PaymentLog {
    path: PathBuf,
}

impl PaymentLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the file with its header if it does not exist yet.
    pub async fn create(&self) -> Result<(), MinerError> {
        self.append("").await
    }

    pub async fn log_request(
        &self,
        pool_ip: &str,
        wallet: &str,
        block: u64,
        amount: &str,
    ) -> Result<(), MinerError> {
        let row = format!(
            "{},{},{},Payment Request,{},{},\n",
            timestamp(),
            pool_ip,
            wallet,
            block,
            parse_amount(amount)
        );
        self.append(&row).await
    }

    pub async fn log_response(&self, payment: &PaymentOk) -> Result<(), MinerError> {
        let row = format!(
            "{},{},{},Payment Response,{},{},{}\n",
            timestamp(),
            payment.pool_ip,
            payment.wallet,
            payment.block,
            parse_amount(&payment.amount),
            payment.order_id
        );
        self.append(&row).await
    }

    async fn append(&self, row: &str) -> Result<(), MinerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                MinerError::Io(format!("Failed to open {} - {}", self.path.display(), e))
            })?;

        if file.metadata().await?.len() == 0 {
            file.write_all(CSV_HEADER.as_bytes()).await?;
        }
        if !row.is_empty() {
            file.write_all(row.as_bytes()).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

fn timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Formats a raw amount in the smallest unit as `X.YYYYYYYY`. Anything that
/// is not a plain run of digits is returned unchanged.
pub fn parse_amount(amount: &str) -> String {
    if amount.is_empty() || !amount.bytes().all(|b| b.is_ascii_digit()) {
        return amount.to_string();
    }
    let padded = format!("{:0>9}", amount);
    let split = padded.len() - 8;
    format!("{}.{}", &padded[..split], &padded[split..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_log() -> (TempDir, PaymentLog) {
        let dir = TempDir::new().unwrap();
        let log = PaymentLog::new(dir.path().join("payments.csv"));
        (dir, log)
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("0"), "0.00000000");
        assert_eq!(parse_amount("21"), "0.00000021");
        assert_eq!(parse_amount("87654321"), "0.87654321");
        assert_eq!(parse_amount("1987654321"), "19.87654321");
        assert_eq!(parse_amount("1.48153045"), "1.48153045");
        assert_eq!(parse_amount("é1234567"), "é1234567");
        assert_eq!(parse_amount("-30"), "-30");
        assert_eq!(parse_amount(""), "");
    }

    #[tokio::test]
    async fn test_header_written_once() {
        let (_dir, log) = temp_log();
        log.create().await.unwrap();
        log.create().await.unwrap();

        let contents = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert_eq!(contents, CSV_HEADER);
    }

    #[tokio::test]
    async fn test_request_and_response_rows() {
        let (_dir, log) = temp_log();
        log.log_request("10.0.0.1", "Nwallet", 5833, "148153045")
            .await
            .unwrap();
        log.log_response(&PaymentOk {
            timestamp: 1618891646,
            pool_ip: "10.0.0.1".into(),
            wallet: "Nwallet".into(),
            block: 5833,
            amount: "1.48153045".into(),
            order_id: "OR60v3w4".into(),
        })
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(log.path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(format!("{}\n", lines[0]), CSV_HEADER);
        assert!(lines[1].ends_with(",10.0.0.1,Nwallet,Payment Request,5833,1.48153045,"));
        assert!(lines[2].ends_with(",10.0.0.1,Nwallet,Payment Response,5833,1.48153045,OR60v3w4"));
    }
}
