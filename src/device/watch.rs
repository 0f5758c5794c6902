//! Edge-triggered watch engine.
//!
//! Every record owns one repeating timer. A tick samples the resource and
//! publishes a response frame on [`Topic::Outbound`] only when the value
//! differs from the last one delivered. Records live in three ordered
//! collections (channel, input, output) keyed by owner and resource, so a
//! second watch for the same pair is a no-op and an owner's records can be
//! removed in bulk.
//!
//! Timers run only while the engine is both enabled and online. Suspending
//! keeps the records; resuming restarts their timers with the last delivered
//! value intact.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, Topic};
use crate::error::Result;
use crate::frame::Frame;
use crate::session::descriptor::Role;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Channel(String),
    Input(u32),
    Output(u32),
}

impl Resource {
    /// Response field carrying the sampled value.
    pub fn value_field(&self) -> &'static str {
        match self {
            Resource::Channel(_) => "result",
            Resource::Input(_) | Resource::Output(_) => "state",
        }
    }

    pub fn label(&self) -> String {
        match self {
            Resource::Channel(name) => name.clone(),
            Resource::Input(pin) => format!("input {pin}"),
            Resource::Output(pin) => format!("output {pin}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchKey {
    pub owner: String,
    pub resource: Resource,
}

impl WatchKey {
    pub fn new(owner: impl Into<String>, resource: Resource) -> Self {
        Self {
            owner: owner.into(),
            resource,
        }
    }
}

/// Reads the current value of a resource.
pub trait Sampler: Send + Sync {
    fn sample(&self, resource: &Resource) -> Result<Value>;
}

impl<F> Sampler for F
where
    F: Fn(&Resource) -> Result<Value> + Send + Sync,
{
    fn sample(&self, resource: &Resource) -> Result<Value> {
        self(resource)
    }
}

#[derive(Debug)]
struct WatchRecord {
    request: Frame,
    interval: Duration,
    last: Option<Value>,
    timer: Option<CancellationToken>,
}

impl WatchRecord {
    fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct Records {
    channel: BTreeMap<WatchKey, WatchRecord>,
    input: BTreeMap<WatchKey, WatchRecord>,
    output: BTreeMap<WatchKey, WatchRecord>,
}

impl Records {
    fn for_resource(&mut self, resource: &Resource) -> &mut BTreeMap<WatchKey, WatchRecord> {
        match resource {
            Resource::Channel(_) => &mut self.channel,
            Resource::Input(_) => &mut self.input,
            Resource::Output(_) => &mut self.output,
        }
    }

    fn all_mut(&mut self) -> impl Iterator<Item = (&WatchKey, &mut WatchRecord)> {
        self.channel
            .iter_mut()
            .chain(self.input.iter_mut())
            .chain(self.output.iter_mut())
    }
}

#[derive(Debug)]
struct EngineState {
    records: Records,
    enabled: bool,
    online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// New record; the first sample was published.
    Registered,
    /// The owner already watches this resource. Nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Published(Value),
    Unchanged,
    /// The record was removed while the tick was pending.
    Gone,
    Failed(String),
}

#[derive(Clone)]
pub struct WatchEngine {
    state: Arc<Mutex<EngineState>>,
    sampler: Arc<dyn Sampler>,
    bus: EventBus,
}

impl std::fmt::Debug for WatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEngine")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl WatchEngine {
    /// Creates an engine that is enabled but offline; call
    /// [`WatchEngine::set_online`] once the session is registered.
    pub fn new(sampler: Arc<dyn Sampler>, bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                records: Records::default(),
                enabled: true,
                online: false,
            })),
            sampler,
            bus,
        }
    }

    /// Registers a watch and publishes the current value. Sampling errors
    /// are returned and nothing is registered.
    pub fn watch(&self, key: WatchKey, request: Frame, interval: Duration) -> Result<WatchOutcome> {
        if self.contains(&key) {
            tracing::debug!(owner = %key.owner, resource = ?key.resource, "duplicate watch dropped");
            return Ok(WatchOutcome::Duplicate);
        }
        let value = self.sampler.sample(&key.resource)?;

        let mut state = self.state.lock();
        let running = state.enabled && state.online;
        let records = state.records.for_resource(&key.resource);
        if records.contains_key(&key) {
            return Ok(WatchOutcome::Duplicate);
        }
        let mut record = WatchRecord {
            request,
            interval: interval.max(Duration::from_millis(1)),
            last: Some(value.clone()),
            timer: None,
        };
        if running {
            record.timer = Some(self.spawn_timer(key.clone(), record.interval));
        }
        let frame = response(&record.request, &key.resource, value);
        records.insert(key, record);
        drop(state);

        self.bus.publish(&Topic::Outbound, frame);
        Ok(WatchOutcome::Registered)
    }

    /// Samples one record and publishes on change.
    pub fn tick(&self, key: &WatchKey) -> TickOutcome {
        let snapshot = {
            let mut state = self.state.lock();
            state
                .records
                .for_resource(&key.resource)
                .get(key)
                .map(|record| record.last.clone())
        };
        let Some(last) = snapshot else {
            return TickOutcome::Gone;
        };
        let value = match self.sampler.sample(&key.resource) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(owner = %key.owner, resource = ?key.resource, error = %err, "watch sample failed");
                return TickOutcome::Failed(err.to_string());
            }
        };
        if last.as_ref() == Some(&value) {
            return TickOutcome::Unchanged;
        }

        let frame = {
            let mut state = self.state.lock();
            let Some(record) = state.records.for_resource(&key.resource).get_mut(key) else {
                return TickOutcome::Gone;
            };
            record.last = Some(value.clone());
            response(&record.request, &key.resource, value.clone())
        };
        self.bus.publish(&Topic::Outbound, frame);
        TickOutcome::Published(value)
    }

    /// Removes the owner's record for `resource`. Returns whether one existed.
    pub fn unwatch(&self, key: &WatchKey) -> bool {
        let removed = self
            .state
            .lock()
            .records
            .for_resource(&key.resource)
            .remove(key);
        match removed {
            Some(mut record) => {
                record.stop();
                true
            }
            None => false,
        }
    }

    /// Removes every record of `owner`.
    pub fn drop_owner(&self, owner: &str) -> usize {
        let mut state = self.state.lock();
        let records = &mut state.records;
        let mut removed = 0;
        for map in [&mut records.channel, &mut records.input, &mut records.output] {
            map.retain(|key, record| {
                if key.owner == owner {
                    record.stop();
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    pub fn suspend(&self) {
        self.state.lock().enabled = false;
        self.refresh_timers();
    }

    pub fn resume(&self) {
        self.state.lock().enabled = true;
        self.refresh_timers();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Follows the session: timers stop while disconnected and restart
    /// after the next registration.
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
        self.refresh_timers();
    }

    /// Removes every record.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for (_, record) in state.records.all_mut() {
            record.stop();
        }
        state.records = Records::default();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.records.channel.len() + state.records.input.len() + state.records.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &WatchKey) -> bool {
        self.state
            .lock()
            .records
            .for_resource(&key.resource)
            .contains_key(key)
    }

    /// Names of watched channels, for `setupData` replies.
    pub fn watched_channels(&self) -> Vec<String> {
        let state = self.state.lock();
        let names: BTreeSet<String> = state
            .records
            .channel
            .keys()
            .filter_map(|key| match &key.resource {
                Resource::Channel(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.into_iter().collect()
    }

    fn refresh_timers(&self) {
        let mut state = self.state.lock();
        let running = state.enabled && state.online;
        let mut started = 0usize;
        let mut stopped = 0usize;
        for (key, record) in state.records.all_mut() {
            match (running, record.timer.is_some()) {
                (true, false) => {
                    record.timer = Some(self.spawn_timer(key.clone(), record.interval));
                    started += 1;
                }
                (false, true) => {
                    record.stop();
                    stopped += 1;
                }
                _ => {}
            }
        }
        if started + stopped > 0 {
            tracing::debug!(started, stopped, "watch timers refreshed");
        }
    }

    fn spawn_timer(&self, key: WatchKey, period: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if engine.tick(&key) == TickOutcome::Gone {
                            break;
                        }
                    }
                }
            }
        });
        token
    }
}

fn response(request: &Frame, resource: &Resource, value: Value) -> Frame {
    let mut frame = request.clone().into_response(Role::Device);
    frame.set(resource.value_field(), value);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use std::collections::VecDeque;

    fn request(owner: &str, name: &str) -> Frame {
        Frame::new()
            .with("id", 100)
            .with("appId", owner)
            .with("name", name)
            .with("event", true)
            .with("watch", true)
            .with("src", "client")
    }

    fn scripted(values: Vec<Value>) -> Arc<dyn Sampler> {
        let queue = Arc::new(Mutex::new(VecDeque::from(values)));
        Arc::new(move |resource: &Resource| -> Result<Value> {
            match resource {
                Resource::Channel(name) if name == "temp" => {
                    let mut queue = queue.lock();
                    let value = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
                    value.ok_or_else(|| Error::Resource("empty".into()))
                }
                Resource::Channel(name) if name == "hum" => Ok(json!(40)),
                Resource::Input(11) => Ok(json!(true)),
                _ => Err(Error::Resource("invalid channel".into())),
            }
        })
    }

    fn temp(owner: &str) -> WatchKey {
        WatchKey::new(owner, Resource::Channel("temp".into()))
    }

    #[tokio::test]
    async fn duplicate_watch_keeps_one_record() {
        let bus = EventBus::new();
        let mut out = bus.subscribe(Topic::Outbound);
        let engine = WatchEngine::new(scripted(vec![json!(1)]), bus.clone());
        let interval = Duration::from_secs(5);
        assert_eq!(engine.watch(temp("c1"), request("c1", "temp"), interval).unwrap(), WatchOutcome::Registered);
        assert_eq!(engine.watch(temp("c1"), request("c1", "temp"), interval).unwrap(), WatchOutcome::Duplicate);
        assert_eq!(engine.len(), 1);
        assert!(out.try_recv().is_some());
        assert!(out.try_recv().is_none());
    }

    #[tokio::test]
    async fn watched_channels_lists_each_name_once() {
        let engine = WatchEngine::new(scripted(vec![json!(1)]), EventBus::new());
        let interval = Duration::from_secs(1);
        let hum = |owner: &str| WatchKey::new(owner, Resource::Channel("hum".into()));
        engine.watch(hum("c1"), request("c1", "hum"), interval).unwrap();
        engine.watch(temp("c1"), request("c1", "temp"), interval).unwrap();
        engine.watch(hum("c2"), request("c2", "hum"), interval).unwrap();
        assert_eq!(engine.watched_channels(), vec!["hum".to_string(), "temp".to_string()]);
    }

    #[tokio::test]
    async fn invalid_resource_is_not_registered() {
        let engine = WatchEngine::new(scripted(vec![json!(1)]), EventBus::new());
        let key = WatchKey::new("c1", Resource::Channel("nope".into()));
        assert!(matches!(
            engine.watch(key.clone(), request("c1", "nope"), Duration::from_secs(1)),
            Err(Error::Resource(m)) if m == "invalid channel"
        ));
        assert!(!engine.contains(&key));
    }

    #[tokio::test]
    async fn ticks_publish_only_on_change() {
        let bus = EventBus::new();
        let mut out = bus.subscribe(Topic::Outbound);
        let engine = WatchEngine::new(
            scripted(vec![json!(1), json!(1), json!(1), json!(2)]),
            bus.clone(),
        );
        engine.watch(temp("c1"), request("c1", "temp"), Duration::from_secs(1)).unwrap();
        let first = out.try_recv().unwrap();
        assert_eq!(first.get("result"), Some(&json!(1)));
        assert_eq!(first.str_field("src"), Some("device"));
        assert_eq!(first.str_field("dst"), Some("client"));

        assert_eq!(engine.tick(&temp("c1")), TickOutcome::Unchanged);
        assert_eq!(engine.tick(&temp("c1")), TickOutcome::Unchanged);
        assert_eq!(engine.tick(&temp("c1")), TickOutcome::Published(json!(2)));
        assert_eq!(engine.tick(&temp("c1")), TickOutcome::Unchanged);
        assert_eq!(out.try_recv().unwrap().get("result"), Some(&json!(2)));
        assert!(out.try_recv().is_none());
    }

    #[tokio::test]
    async fn unwatch_and_owner_teardown_are_scoped() {
        let engine = WatchEngine::new(scripted(vec![json!(1)]), EventBus::new());
        let interval = Duration::from_secs(1);
        let pin = |owner: &str| WatchKey::new(owner, Resource::Input(11));
        engine.watch(temp("c1"), request("c1", "temp"), interval).unwrap();
        engine.watch(temp("c2"), request("c2", "temp"), interval).unwrap();
        engine.watch(pin("c1"), request("c1", "temp"), interval).unwrap();
        engine.watch(pin("c2"), request("c2", "temp"), interval).unwrap();

        assert!(engine.unwatch(&temp("c1")));
        assert!(!engine.unwatch(&temp("c1")));
        assert!(engine.contains(&temp("c2")));
        assert!(engine.contains(&pin("c1")));

        assert_eq!(engine.drop_owner("c2"), 2);
        assert_eq!(engine.len(), 1);
        assert!(engine.contains(&pin("c1")));
        assert_eq!(engine.tick(&temp("c2")), TickOutcome::Gone);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_follow_enable_and_online() {
        let bus = EventBus::new();
        let mut out = bus.subscribe(Topic::Outbound);
        let engine = WatchEngine::new(
            scripted(vec![json!(1), json!(2), json!(3), json!(4)]),
            bus.clone(),
        );
        engine.watch(temp("c1"), request("c1", "temp"), Duration::from_secs(1)).unwrap();
        assert_eq!(out.try_recv().unwrap().get("result"), Some(&json!(1)));

        // offline: no timer yet
        time::sleep(Duration::from_millis(3_500)).await;
        assert!(out.try_recv().is_none());

        engine.set_online(true);
        time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(out.try_recv().unwrap().get("result"), Some(&json!(2)));

        engine.suspend();
        time::sleep(Duration::from_millis(5_000)).await;
        assert!(out.try_recv().is_none());
        assert_eq!(engine.len(), 1);

        engine.resume();
        time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(out.try_recv().unwrap().get("result"), Some(&json!(3)));

        engine.clear();
        time::sleep(Duration::from_millis(5_000)).await;
        assert!(out.try_recv().is_none());
        assert!(engine.is_empty());
    }
}
