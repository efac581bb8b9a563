use relay_daemon::{server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _telemetry = telemetry::init("relay-daemon")?;
    server::run().await
}
