use std::sync::Arc;

use envoy_meter_bridge::{EnvoyConfig, EnvoyReader, Reading};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting envoy meter bridge");
    let config = EnvoyConfig::from_env()?;

    // The Envoy serves its local endpoints over https with a self-signed
    // certificate. One shared client covers polling and streaming; no
    // request timeout, the live stream stays open indefinitely.
    let session = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;

    let reader = Arc::new(EnvoyReader::new(&config));

    let serial = reader.identify(&session).await?;
    info!(serial, "connected to envoy");

    let (readings_tx, readings_rx) = mpsc::channel::<Reading>(32);
    spawn_readings_consumer(readings_rx);

    reader.start_stream(&session, readings_tx.clone());

    let mut poll = interval(config.poll_interval);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                match reader.snapshot(&session).await {
                    Ok(reading) => {
                        if readings_tx.send(reading).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "snapshot failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                reader.stop_stream();
                break;
            }
        }
    }

    Ok(())
}

/// Stand-in for downstream sensor displays: logs every normalized reading
/// it receives.
fn spawn_readings_consumer(mut readings_rx: mpsc::Receiver<Reading>) {
    tokio::spawn(async move {
        while let Some(reading) = readings_rx.recv().await {
            let production = reading.get("production").copied();
            let total_consumption = reading.get("total_consumption").copied();
            info!(
                fields = reading.len(),
                ?production,
                ?total_consumption,
                "reading"
            );
        }
    });
}
