use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use m2m::device::channel::ChannelRequest;
use m2m::e2e_common::{test_credentials, FakeRelay, RelayOptions};
use m2m::{
    Client, Config, Credentials, Device, Error, NullEventLog, Result, SessionExit, SessionHandle,
    SimulatedGpio, StaticCredentials,
};

const WAIT: Duration = Duration::from_secs(5);

/// Polls `cond` until it holds or the wait runs out.
async fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

struct Running {
    handle: SessionHandle,
    task: JoinHandle<Result<SessionExit>>,
}

impl Running {
    async fn stop(self) -> Result<SessionExit> {
        self.handle.shutdown();
        self.task.await.expect("session task panicked")
    }
}

fn start_device(device: &Device, credentials: Credentials) -> Running {
    let session = device
        .session()
        .with_credentials(Arc::new(StaticCredentials::new(credentials)));
    let handle = session.handle();
    Running {
        handle,
        task: tokio::spawn(session.run()),
    }
}

fn start_client(client: &Client, credentials: Credentials) -> Running {
    let session = client
        .session()
        .with_credentials(Arc::new(StaticCredentials::new(credentials)));
    let handle = session.handle();
    Running {
        handle,
        task: tokio::spawn(session.run()),
    }
}

fn device(id: u64, config: Config) -> Device {
    Device::builder(id)
        .config(config)
        .gpio(Arc::new(SimulatedGpio::new([11], [13])))
        .event_log(Arc::new(NullEventLog))
        .build()
        .unwrap()
}

fn client(app_id: &str, config: Config) -> Client {
    Client::builder()
        .app_id(app_id)
        .config(config)
        .event_log(Arc::new(NullEventLog))
        .build()
        .unwrap()
}

/// Channel source that replays `values`, repeating the last one.
fn replay(values: Vec<Value>) -> impl Fn(&ChannelRequest) -> Result<Value> + Send + Sync {
    let queue = Mutex::new(VecDeque::from(values));
    move |_request: &ChannelRequest| -> Result<Value> {
        let mut queue = queue.lock();
        let value = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        value.ok_or_else(|| Error::Resource("no data".into()))
    }
}

struct Fixture {
    relay: FakeRelay,
    device: Device,
    client: Client,
    device_run: Running,
    client_run: Running,
    _dirs: (TempDir, TempDir),
}

async fn connected(device_id: u64, app_id: &str, setup: impl FnOnce(&Device)) -> Fixture {
    let relay = FakeRelay::start().await.unwrap();
    let device_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();

    let device = device(device_id, relay.config(device_dir.path()));
    setup(&device);
    let device_run = start_device(&device, test_credentials().unwrap());
    assert!(relay.wait_device(device_id, WAIT).await, "device never registered");

    let client = client(app_id, relay.config(client_dir.path()));
    let client_run = start_client(&client, test_credentials().unwrap());
    assert!(relay.wait_client(app_id, WAIT).await, "client never registered");
    assert!(
        relay
            .wait_for(WAIT, |f| f.flag("getRegisteredDevices"))
            .await
            .is_some()
    );

    Fixture {
        relay,
        device,
        client,
        device_run,
        client_run,
        _dirs: (device_dir, client_dir),
    }
}

fn token_written(dir: &Path) -> bool {
    dir.join("tk").exists()
}

#[tokio::test]
async fn client_reads_device_channel_through_relay() {
    let fx = connected(100, "c1", |device| {
        device
            .set_channel_data("temp", |_request: &ChannelRequest| -> Result<Value> { Ok(json!(21.5)) })
            .unwrap();
    })
    .await;

    let remote = fx.client.access_device(100).unwrap();
    assert_eq!(remote.get_data("temp").await.unwrap(), json!(21.5));

    let setup = remote.setup_info().await.unwrap();
    assert_eq!(setup["id"], json!(100));
    assert_eq!(setup["channel"]["name"], json!(["temp"]));
    assert_eq!(setup["gpio"]["input"]["pin"], json!([11]));

    let devices = fx.client.get_devices().await.unwrap();
    assert!(devices.iter().any(|d| d["id"] == json!(100)));

    let missing = remote.get_data("humidity").await.unwrap_err();
    assert!(matches!(missing, Error::Resource(_)));

    assert!(token_written(fx._dirs.0.path()));
    assert!(token_written(fx._dirs.1.path()));
    assert!(matches!(fx.client_run.stop().await, Ok(SessionExit::Shutdown)));
    assert!(matches!(fx.device_run.stop().await, Ok(SessionExit::Shutdown)));
}

#[tokio::test]
async fn channel_watch_delivers_changes_until_unwatched() {
    let fx = connected(100, "c1", |device| {
        device
            .set_channel_data("temp", replay(vec![json!(21.5), json!(21.5), json!(22.0)]))
            .unwrap();
    })
    .await;

    let channel = fx.client.access_device(100).unwrap().channel("temp");
    let mut stream = channel.watch(50u64).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), json!(21.5));
    assert_eq!(stream.next().await.unwrap().unwrap(), json!(22.0));
    assert_eq!(fx.device.watches().len(), 1);

    // Watching again reuses the standing registration.
    let again = channel.watch(50u64).await.unwrap();
    assert_eq!(again.key(), stream.key());
    assert_eq!(fx.client.active_sync().len(), 1);

    assert!(channel.unwatch().await.unwrap());
    assert!(stream.next().await.is_none());
    assert!(fx.device.watches().is_empty());
    assert!(!channel.unwatch().await.unwrap());

    fx.client_run.stop().await.unwrap();
    fx.device_run.stop().await.unwrap();
}

#[tokio::test]
async fn gpio_pins_are_read_and_driven_remotely() {
    let gpio = Arc::new(SimulatedGpio::new([11], [13]));
    gpio.set_input(11, true).unwrap();
    let relay = FakeRelay::start().await.unwrap();
    let (device_dir, client_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let device = Device::builder(100)
        .config(relay.config(device_dir.path()))
        .gpio(gpio.clone())
        .event_log(Arc::new(NullEventLog))
        .build()
        .unwrap();
    let device_run = start_device(&device, test_credentials().unwrap());
    assert!(relay.wait_device(100, WAIT).await);
    let client = client("c1", relay.config(client_dir.path()));
    let client_run = start_client(&client, test_credentials().unwrap());
    assert!(relay.wait_client("c1", WAIT).await);

    let remote = client.access_device(100).unwrap();
    assert!(remote.input(11).state().await.unwrap());
    let output = remote.output(13);
    assert!(!output.state().await.unwrap());
    assert!(output.on(None).await.unwrap());
    assert!(output.state().await.unwrap());
    assert!(!output.off(Some(Duration::from_millis(10))).await.unwrap());

    let err = remote.output(99).state().await.unwrap_err();
    assert!(matches!(err, Error::Resource(_)));

    let mut pin = remote.input(11).watch(50u64).await.unwrap();
    assert_eq!(pin.next().await.unwrap().unwrap(), json!(true));
    gpio.set_input(11, false).unwrap();
    assert_eq!(pin.next().await.unwrap().unwrap(), json!(false));
    assert!(remote.input(11).unwatch().await.unwrap());

    client_run.stop().await.unwrap();
    device_run.stop().await.unwrap();
}

#[tokio::test]
async fn requests_to_an_absent_device_fail_with_offline_error() {
    let relay = FakeRelay::start_with(RelayOptions {
        account: None,
        registered_devices: vec![200],
    })
    .await
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let client = client("c1", relay.config(dir.path()));
    let client_run = start_client(&client, test_credentials().unwrap());
    assert!(relay.wait_client("c1", WAIT).await);

    let err = client.access_device(200).unwrap().get_data("temp").await.unwrap_err();
    assert_eq!(err.to_string(), "device[200] is off-line");

    client_run.stop().await.unwrap();
}

#[tokio::test]
async fn device_exit_reaches_watchers_and_watches_resume_on_return() {
    let fx = connected(100, "c1", |device| {
        device
            .set_channel_data("temp", |_request: &ChannelRequest| -> Result<Value> { Ok(json!(1)) })
            .unwrap();
    })
    .await;

    let mut stream = fx.client.access_device(100).unwrap().watch("temp", 50u64).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));

    fx.device_run.stop().await.unwrap();
    let notice = stream.next().await.unwrap().unwrap_err();
    assert_eq!(notice.to_string(), "device[100] is off-line");
    assert!(!fx.client.liveness().is_available(&m2m::EndpointId::Num(100)));

    // The device restarts with its stored token; the client replays its watch.
    let device_run = start_device(&fx.device, test_credentials().unwrap());
    assert!(fx.relay.wait_device(100, WAIT).await);
    assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));
    assert!(fx.client.liveness().is_available(&m2m::EndpointId::Num(100)));

    fx.client_run.stop().await.unwrap();
    device_run.stop().await.unwrap();
}

#[tokio::test]
async fn client_exit_tears_down_its_watches_on_the_device() {
    let fx = connected(100, "c1", |device| {
        device
            .set_channel_data("temp", |_request: &ChannelRequest| -> Result<Value> { Ok(json!(1)) })
            .unwrap();
    })
    .await;

    let mut stream = fx.client.access_device(100).unwrap().watch("temp", 50u64).await.unwrap();
    stream.next().await.unwrap().unwrap();
    assert_eq!(fx.device.watches().len(), 1);

    fx.client_run.stop().await.unwrap();
    let device = fx.device.clone();
    assert!(eventually(|| device.watches().is_empty()).await);

    fx.device_run.stop().await.unwrap();
}

#[tokio::test]
async fn sessions_reconnect_with_stored_token_after_connection_loss() {
    let fx = connected(100, "c1", |device| {
        device
            .set_channel_data("temp", |_request: &ChannelRequest| -> Result<Value> { Ok(json!(7)) })
            .unwrap();
    })
    .await;
    assert_eq!(fx.relay.registrations(), 2);

    fx.relay.drop_connections();
    let relay = &fx.relay;
    assert!(eventually(|| relay.registrations() >= 4).await);
    assert!(relay.wait_device(100, WAIT).await);
    assert!(relay.wait_client("c1", WAIT).await);

    // Token reconnects carry no sealed credentials.
    let reconnects = relay
        .received()
        .into_iter()
        .filter(|f| f.contains("aid") && f.contains("systemInfo") && !f.contains("euc"))
        .count();
    assert!(reconnects >= 2);

    let client = fx.client.clone();
    let remote = client.access_device(100).unwrap();
    let mut value = None;
    for _ in 0..50 {
        match remote.get_data("temp").await {
            Ok(v) => {
                value = Some(v);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert_eq!(value, Some(json!(7)));

    fx.client_run.stop().await.unwrap();
    fx.device_run.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_credentials_end_the_session() {
    let relay = FakeRelay::start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let device = device(100, relay.config(dir.path()));
    let wrong = Credentials::new("x@y.com", "Zyxwvu9!", None).unwrap();
    let run = start_device(&device, wrong);

    let result = tokio::time::timeout(WAIT, run.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Authentication(_))));
    assert!(!token_written(dir.path()));
}

#[tokio::test]
async fn unpinned_relay_key_is_refused_before_registration() {
    let relay = FakeRelay::start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut config = relay.config(dir.path());
    let other = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
    config.server_key = Some(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        other.verifying_key().as_bytes(),
    ));
    let device = device(100, config);
    let run = start_device(&device, test_credentials().unwrap());

    let result = tokio::time::timeout(WAIT, run.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Authentication(_))));
    assert_eq!(relay.registrations(), 0);
}
