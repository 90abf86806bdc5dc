//! s3-sftp-relay entry point
//!
//! `s3-sftp-relay [EVENT_FILE]` reads one event (from the file, or stdin when
//! omitted), prints the result as a single JSON line and exits with
//! 0 on success, 1 on a failed transfer, 2 when it could not start.

use std::process::ExitCode;
use std::sync::Arc;

use aws_config::BehaviorVersion;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{error, warn};

use s3_sftp_relay::credentials::SecretsManagerProvider;
use s3_sftp_relay::sftp::SftpTransport;
use s3_sftp_relay::store::S3ObjectFetcher;
use s3_sftp_relay::{init_tracing, RelayConfig, TransferHandler};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V") {
        println!("s3-sftp-relay {}", VERSION);
        return ExitCode::SUCCESS;
    }

    init_tracing();

    let config = match RelayConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::from(2);
        }
    };

    let raw = match read_event(args.get(1).map(String::as_str)).await {
        Ok(raw) => raw,
        Err(e) => {
            error!("Failed to read event: {}", e);
            return ExitCode::from(2);
        }
    };

    let aws = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let handler = TransferHandler::new(
        config.clone(),
        Arc::new(S3ObjectFetcher::new(
            aws_sdk_s3::Client::new(&aws),
            config.max_object_bytes,
        )),
        Arc::new(SecretsManagerProvider::new(
            aws_sdk_secretsmanager::Client::new(&aws),
        )),
        Arc::new(SftpTransport::from_config(&config)),
    );

    let raw = serde_json::from_str::<Value>(&raw).unwrap_or_else(|e| {
        warn!("Event is not valid JSON: {}", e);
        Value::Null
    });
    let result = handler.handle(&raw).await;

    match serde_json::to_string(&result) {
        Ok(line) => println!("{}", line),
        Err(e) => {
            error!("Failed to serialize result: {}", e);
            return ExitCode::from(2);
        }
    }

    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn read_event(path: Option<&str>) -> Result<String, String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("{}: {}", path, e)),
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .map_err(|e| format!("stdin: {}", e))?;
            Ok(text)
        }
    }
}
