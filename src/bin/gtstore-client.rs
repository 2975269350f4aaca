//! Command-line driver for one-shot get/put operations.
//!
//! Exit codes: 0 on success, 1 on usage errors, 2 when the operation failed
//! on every replica.
use clap::Parser;
use gtstore::client::StoreClient;
use gtstore::config::{DEFAULT_MANAGER_HOST, DEFAULT_MANAGER_PORT};
use gtstore::ring::NodeAddress;

#[derive(Debug, Parser)]
#[command(name = "gtstore-client")]
#[command(about = "gtstore command line client", long_about = None)]
struct Cli {
    /// Key to read.
    #[arg(long)]
    get: Option<String>,

    /// Key to write; requires --val.
    #[arg(long)]
    put: Option<String>,

    /// Comma-separated value list for --put.
    #[arg(long)]
    val: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MANAGER_HOST.to_string())]
    manager_host: String,

    #[arg(long, default_value_t = DEFAULT_MANAGER_PORT)]
    manager_port: u16,
}

#[tokio::main]
async fn main() {
    gtstore::telemetry::init();

    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let manager_addr = NodeAddress {
        host: args.manager_host.clone(),
        port: args.manager_port,
    };

    let exit_code = match (args.get, args.put) {
        (Some(key), None) => {
            let mut client = StoreClient::init("cli", manager_addr).await;
            let value = client.get(&key).await;
            client.finalize();

            if value.is_empty() {
                eprintln!("get failed for key {}", key);
                2
            } else {
                println!("{}", value.join(","));
                0
            }
        }
        (None, Some(key)) => {
            let Some(val) = args.val else {
                eprintln!("--put requires --val");
                std::process::exit(1);
            };
            let value: Vec<String> = val.split(',').map(str::to_string).collect();

            let mut client = StoreClient::init("cli", manager_addr).await;
            let stored = client.put(&key, &value).await;
            client.finalize();

            if stored {
                println!("ok");
                0
            } else {
                eprintln!("put failed for key {}", key);
                2
            }
        }
        _ => {
            eprintln!("usage: gtstore-client --get KEY | --put KEY --val VAL");
            1
        }
    };

    std::process::exit(exit_code);
}
