//! # Topic Router
//!
//! Ordered topic-to-handler bindings and the dispatch algorithm that maps
//! inbound broker traffic onto devices, plus every outbound publish the
//! bridge makes.
//!
//! Per connected device up to three bindings exist, registered in a fixed
//! priority order: the external mirror status topic (only when the device has
//! a mirror index), the device's direct topic, and the shared aggregate
//! topic. Registration order is evaluation order; the first binding whose
//! topic matches and whose `accepts` predicate consumes the payload wins.
//!
//! The router both publishes and subscribes to overlapping topics, so every
//! outbound payload carries the self-origin marker and inbound messages with
//! that marker are discarded before any binding runs.

use super::{BrokerCommand, BrokerSender, SELF_ORIGIN};
use crate::bus::EventBus;
use crate::device::manager::ManagerCommand;
use crate::registry::Device;
use chrono::Local;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Data-point key holding the primary boolean state of a device.
const PRIMARY_DP: &str = "1";

/// Most-recent-N ring of handled broker traffic, observability only.
const HANDLED_LOG_CAPACITY: usize = 20;

/// Topic match side of a binding: an exact topic or an MQTT-style filter
/// with `+`/`#` wildcards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicMatcher {
    Exact(String),
    Pattern(String),
}

impl TopicMatcher {
    /// The string handed to the broker when subscribing for this matcher.
    pub fn filter(&self) -> &str {
        match self {
            Self::Exact(t) | Self::Pattern(t) => t,
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(t) => t == topic,
            Self::Pattern(p) => filter_matches(p, topic),
        }
    }
}

fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// What a binding listens for once its topic matched.
#[derive(Clone, Debug)]
pub enum BindingKind {
    /// External mirror status scoped by numeric index.
    MirrorOut { idx: u32 },
    /// Device-specific direct topic carrying raw data points.
    Direct,
    /// Shared broadcast topic, scoped by the embedded device id.
    Aggregate,
}

/// One topic-to-handler binding, scoped to a device's connected lifetime.
#[derive(Clone, Debug)]
pub struct TopicBinding {
    pub device_id: String,
    pub matcher: TopicMatcher,
    pub kind: BindingKind,
}

impl TopicBinding {
    /// Decides whether this binding consumes the payload. On consume, yields
    /// the target state for the device.
    pub fn accepts(&self, payload: &Value) -> Option<bool> {
        match &self.kind {
            BindingKind::MirrorOut { idx } => {
                if payload.get("idx")?.as_u64()? != u64::from(*idx) {
                    return None;
                }
                Some(payload.get("nvalue").and_then(Value::as_i64) == Some(1))
            }
            BindingKind::Direct => payload.get(PRIMARY_DP).map(truthy),
            BindingKind::Aggregate => {
                if payload.get("device")?.as_str()? != self.device_id {
                    return None;
                }
                payload.get("data")?.get(PRIMARY_DP).map(truthy)
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Default)]
struct RouterState {
    /// Registration order is evaluation order.
    bindings: Vec<TopicBinding>,
    /// Active broker subscriptions, reference-counted per topic filter so a
    /// topic shared by several devices is subscribed once and unsubscribed
    /// only when the last user goes away.
    subscriptions: HashMap<String, usize>,
}

struct HandledMessageLog {
    lines: VecDeque<String>,
}

impl HandledMessageLog {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(HANDLED_LOG_CAPACITY),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= HANDLED_LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

pub struct TopicRouter {
    prefix: String,
    mirror: String,
    state: Mutex<RouterState>,
    handled: Mutex<HandledMessageLog>,
    broker: BrokerSender,
    commands: mpsc::Sender<ManagerCommand>,
    bus: Arc<EventBus>,
}

impl TopicRouter {
    pub fn new(
        prefix: impl Into<String>,
        mirror: impl Into<String>,
        broker: BrokerSender,
        commands: mpsc::Sender<ManagerCommand>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            mirror: mirror.into(),
            state: Mutex::new(RouterState::default()),
            handled: Mutex::new(HandledMessageLog::new()),
            broker,
            commands,
            bus,
        })
    }

    pub fn device_topic(&self, device_id: &str) -> String {
        format!("{}/{}", self.prefix, device_id)
    }

    pub fn aggregate_topic(&self) -> String {
        format!("{}/out", self.prefix)
    }

    pub fn debug_topic(&self) -> String {
        format!("{}/debug", self.prefix)
    }

    pub fn mirror_in_topic(&self) -> String {
        format!("{}/in", self.mirror)
    }

    pub fn mirror_out_topic(&self) -> String {
        format!("{}/out", self.mirror)
    }

    /// Registers the device's bindings and subscribes any topic not already
    /// held by another device. Called once per device connect; paired with
    /// `unregister_device` on disconnect or removal.
    pub async fn register_device(&self, device: &Device) {
        let mut bindings = Vec::with_capacity(3);
        if let Some(idx) = device.domoticz {
            bindings.push(TopicBinding {
                device_id: device.id.clone(),
                matcher: TopicMatcher::Exact(self.mirror_out_topic()),
                kind: BindingKind::MirrorOut { idx },
            });
        }
        bindings.push(TopicBinding {
            device_id: device.id.clone(),
            matcher: TopicMatcher::Exact(self.device_topic(&device.id)),
            kind: BindingKind::Direct,
        });
        bindings.push(TopicBinding {
            device_id: device.id.clone(),
            matcher: TopicMatcher::Exact(self.aggregate_topic()),
            kind: BindingKind::Aggregate,
        });

        let to_subscribe = {
            let mut state = self.state.lock().expect("router state poisoned");
            let mut fresh = Vec::new();
            for binding in bindings {
                let filter = binding.matcher.filter().to_string();
                let count = state.subscriptions.entry(filter.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    fresh.push(filter);
                }
                state.bindings.push(binding);
            }
            fresh
        };

        for topic in to_subscribe {
            debug!(%topic, "subscribing");
            if self
                .broker
                .send(BrokerCommand::Subscribe(topic))
                .await
                .is_err()
            {
                warn!("broker queue closed, subscription dropped");
            }
        }
    }

    /// Drops the device's bindings; unsubscribes each topic no other active
    /// device still needs.
    pub async fn unregister_device(&self, device_id: &str) {
        let to_unsubscribe = {
            let mut state = self.state.lock().expect("router state poisoned");
            let mut removed = Vec::new();
            state.bindings.retain(|b| {
                if b.device_id == device_id {
                    removed.push(b.matcher.filter().to_string());
                    false
                } else {
                    true
                }
            });

            let mut stale = Vec::new();
            for filter in removed {
                if let Some(count) = state.subscriptions.get_mut(&filter) {
                    *count -= 1;
                    if *count == 0 {
                        state.subscriptions.remove(&filter);
                        stale.push(filter);
                    }
                }
            }
            stale
        };

        for topic in to_unsubscribe {
            debug!(%topic, "unsubscribing");
            if self
                .broker
                .send(BrokerCommand::Unsubscribe(topic))
                .await
                .is_err()
            {
                warn!("broker queue closed, unsubscribe dropped");
            }
        }
    }

    /// Dispatches one inbound broker message.
    ///
    /// Unparseable payloads are logged and discarded, own traffic is dropped
    /// by the self-origin marker, and a message no binding accepts is
    /// silently ignored: several devices share the broadcast topics.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, "discarding unparseable payload: {e}");
                return;
            }
        };

        if value.get("src").and_then(Value::as_str) == Some(SELF_ORIGIN) {
            debug!(topic, "own message reflected by broker, ignoring");
            return;
        }

        let hit = {
            let state = self.state.lock().expect("router state poisoned");
            state.bindings.iter().find_map(|binding| {
                if !binding.matcher.matches(topic) {
                    return None;
                }
                binding
                    .accepts(&value)
                    .map(|on| (binding.device_id.clone(), on))
            })
        };

        let Some((device_id, on)) = hit else {
            debug!(topic, "no binding accepted message");
            return;
        };

        self.log_line(format!(
            "MQTT < {} - {}",
            topic,
            String::from_utf8_lossy(payload)
        ));
        if let Err(e) = self
            .commands
            .try_send(ManagerCommand::SetState { device_id, on })
        {
            warn!("dropping state command: {e}");
        }
    }

    /// Publishes a lightweight status notification to the debug topic.
    pub async fn publish_status(&self, device_id: &str, event: &str) {
        let payload = json!({
            "src": SELF_ORIGIN,
            "event": event,
            "device": device_id,
        });
        self.log_line(format!("MQTT > {device_id} - {payload}"));
        self.send_publish(self.debug_topic(), payload).await;
    }

    /// Publishes a device state report: the device's own topic, the shared
    /// aggregate topic, and the external mirror when a mirror index is
    /// configured and the primary data point is present.
    ///
    /// Mirror messages follow the external system's schema and carry no
    /// origin marker; the mirror input topic is never subscribed.
    pub async fn publish_data(
        &self,
        device_id: &str,
        dps: &Map<String, Value>,
        mirror: Option<u32>,
    ) {
        let mut direct = Map::new();
        direct.insert("src".to_string(), json!(SELF_ORIGIN));
        for (k, v) in dps {
            direct.insert(k.clone(), v.clone());
        }
        self.send_publish(self.device_topic(device_id), Value::Object(direct))
            .await;

        let aggregate = json!({
            "src": SELF_ORIGIN,
            "device": device_id,
            "data": dps,
        });
        self.send_publish(self.aggregate_topic(), aggregate).await;

        if let Some(idx) = mirror {
            if let Some(primary) = dps.get(PRIMARY_DP) {
                let nvalue = if truthy(primary) { 1 } else { 0 };
                self.send_publish(self.mirror_in_topic(), json!({"idx": idx, "nvalue": nvalue}))
                    .await;
            }
        }

        self.log_line(format!(
            "MQTT > {} - {}",
            device_id,
            Value::Object(dps.clone())
        ));
    }

    /// Recent handled traffic, oldest first.
    pub fn recent_messages(&self) -> Vec<String> {
        self.handled
            .lock()
            .expect("handled log poisoned")
            .lines
            .iter()
            .cloned()
            .collect()
    }

    async fn send_publish(&self, topic: String, payload: Value) {
        let command = BrokerCommand::Publish {
            topic,
            payload: payload.to_string(),
        };
        if self.broker.send(command).await.is_err() {
            warn!("broker queue closed, publish dropped");
        }
    }

    fn log_line(&self, line: String) {
        let stamped = format!("{} {}", Local::now().format("%H:%M:%S"), line);
        self.handled
            .lock()
            .expect("handled log poisoned")
            .push(stamped.clone());
        self.bus.publish_log(stamped);
    }
}
