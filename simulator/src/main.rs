mod gateway;

use std::time::Duration;

use clap::Parser;
use gateway::Gateway;
use tracing::{error, info, warn};

/// Generates gateway batch traffic against a running proxy instance.
#[derive(Debug, Parser)]
struct Args {
    /// Ingestion endpoint of the proxy
    #[arg(long, env = "PROXY_URL", default_value = "http://localhost:8080/data")]
    proxy_url: String,

    /// Milliseconds between batch rounds
    #[arg(long, env = "INTERVAL_MS", default_value_t = 1000)]
    interval_ms: u64,

    /// Number of simulated gateways
    #[arg(long, env = "GATEWAYS", default_value_t = 2)]
    gateways: usize,

    /// Devices attached to each gateway
    #[arg(long, env = "DEVICES", default_value_t = 8)]
    devices: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting gateway simulator");
    info!(
        "Target: {}, interval: {}ms, gateways: {}, devices each: {}",
        args.proxy_url, args.interval_ms, args.gateways, args.devices
    );

    let mut rng = rand::thread_rng();
    let gateways: Vec<Gateway> = (0..args.gateways)
        .map(|i| Gateway::generate(i, args.devices, &mut rng))
        .collect();

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let interval = Duration::from_millis(args.interval_ms);
    let mut counter = 0u64;

    loop {
        for gw in &gateways {
            let batch = gw.make_batch(&mut rng);

            match client.post(&args.proxy_url).json(&batch).send().await {
                Ok(response) if response.status().is_success() => {
                    counter += 1;
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    warn!("Batch from {} rejected: {} {}", gw.gwmac, status, body);
                }
                Err(e) => {
                    warn!("Failed to send batch from {}: {}", gw.gwmac, e);
                }
            }
        }

        if counter > 0 && counter % 100 == 0 {
            info!("Sent {} batches", counter);
        }

        tokio::time::sleep(interval).await;
    }
}
