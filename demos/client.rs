use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use m2m::{Client, Config, Credentials, StaticCredentials};
use tracing_subscriber::EnvFilter;

// Usage: M2M_USER=a@b.com M2M_PASSWORD=... cargo run --example client -- 100 [config.json]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let device_id: u64 = args.next().as_deref().unwrap_or("100").parse()?;
    let config_path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("m2m.json"));
    let config = Config::load(Some(&config_path))?;

    let credentials = Credentials::new(
        std::env::var("M2M_USER")?,
        std::env::var("M2M_PASSWORD")?,
        None,
    )?;

    let client = Client::builder().config(config).build()?;
    let session = client
        .session()
        .with_credentials(Arc::new(StaticCredentials::new(credentials)));
    let handle = session.handle();
    let running = tokio::spawn(session.run());

    // Give the session time to register before issuing requests.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let device = client.access_device(device_id)?;
    println!("setup: {}", device.setup_info().await?);
    println!("temp: {}", device.get_data("temp").await?);
    println!("output 33 on: {}", device.output(33).on(None).await?);

    let mut temps = device.watch("temp", Duration::from_secs(3)).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            value = temps.next() => match value {
                Some(Ok(value)) => println!("temp changed: {value}"),
                Some(Err(err)) => println!("watch: {err}"),
                None => break,
            },
        }
    }

    device.unwatch("temp").await?;
    handle.shutdown();
    running.await??;
    Ok(())
}
