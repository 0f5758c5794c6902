use std::path::PathBuf;
use std::sync::Arc;

use m2m::device::channel::ChannelRequest;
use m2m::{Config, Credentials, Device, SessionExit, SimulatedGpio, StaticCredentials};
use rand::Rng;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// Usage: M2M_USER=a@b.com M2M_PASSWORD=... cargo run --example device -- 100 [config.json]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let id: u64 = args.next().as_deref().unwrap_or("100").parse()?;
    let config_path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("m2m.json"));
    let config = Config::load(Some(&config_path))?;

    let credentials = Credentials::new(
        std::env::var("M2M_USER")?,
        std::env::var("M2M_PASSWORD")?,
        std::env::var("M2M_CODE").ok().as_deref(),
    )?;

    let device = Device::builder(id)
        .config(config)
        .gpio(Arc::new(SimulatedGpio::new([11, 13], [33, 35])))
        .build()?;

    device.set_channel_data("temp", |_request: &ChannelRequest| -> m2m::Result<Value> {
        let reading: f64 = rand::thread_rng().gen_range(200..260) as f64 / 10.0;
        Ok(json!(reading))
    })?;
    device.set_api("/echo", |request: &ChannelRequest| -> m2m::Result<Value> {
        Ok(request.data.clone().unwrap_or(Value::Null))
    })?;

    let session = device
        .session()
        .with_credentials(Arc::new(StaticCredentials::new(credentials)));
    let handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    match session.run().await? {
        SessionExit::Shutdown => println!("device {id} stopped"),
        SessionExit::SecurityCodeReset { reason, code } => {
            println!("{reason}");
            if let Some(code) = code {
                println!("new security code: {code}");
            }
        }
    }
    Ok(())
}
