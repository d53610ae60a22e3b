use anyhow::Result;

use flux_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("flux-daemon")?;
    flux_daemon::server::run().await
}
