//! Debounced change notifications.
//!
//! After local edits settle, the declared shared objects of a document are
//! serialized to JSON and POSTed to a webhook:
//!
//! ```json
//! { "room": "notes", "data": { "title": { "type": "Text", "content": "..." } } }
//! ```
//!
//! Delivery is fire-and-forget: failures are logged, never retried.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use yrs::types::ToJson;
use yrs::{Any, Doc, GetString, ReadTxn, Transact};

use crate::config::NotifyConfig;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Declared kind of a shared object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedObjectKind {
    Array,
    Map,
    Text,
    XmlFragment,
    XmlElement,
}

impl FromStr for SharedObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Array" => Ok(Self::Array),
            "Map" => Ok(Self::Map),
            "Text" => Ok(Self::Text),
            "XmlFragment" => Ok(Self::XmlFragment),
            "XmlElement" => Ok(Self::XmlElement),
            other => Err(format!("unknown shared object kind {other:?}")),
        }
    }
}

/// JSON content of the root object `name`, read as `kind`.
///
/// A root that was never defined reads as the kind's empty value.
pub fn shared_object_content<T: ReadTxn>(txn: &T, name: &str, kind: SharedObjectKind) -> Value {
    match kind {
        SharedObjectKind::Array => txn
            .get_array(name)
            .map_or_else(|| json!([]), |array| any_to_json(&array.to_json(txn))),
        SharedObjectKind::Map => txn
            .get_map(name)
            .map_or_else(|| json!({}), |map| any_to_json(&map.to_json(txn))),
        SharedObjectKind::Text => {
            Value::String(txn.get_text(name).map(|t| t.get_string(txn)).unwrap_or_default())
        }
        // Elements only exist nested in fragments; a root is read as a fragment.
        SharedObjectKind::XmlFragment | SharedObjectKind::XmlElement => Value::String(
            txn.get_xml_fragment(name)
                .map(|x| x.get_string(txn))
                .unwrap_or_default(),
        ),
    }
}

pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                Value::from(*n as i64)
            } else {
                serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number)
            }
        }
        Any::BigInt(n) => Value::from(*n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

/// Builds and delivers webhook payloads.
pub struct Notifier {
    client: reqwest::Client,
    url: String,
    objects: BTreeMap<String, String>,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            objects: config.objects.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Payload for document `room`. Objects of an unknown kind get `{}`.
    pub fn payload(&self, room: &str, doc: &Doc) -> Value {
        let txn = doc.transact();
        let mut data = Map::new();
        for (name, kind) in &self.objects {
            let content = match kind.parse::<SharedObjectKind>() {
                Ok(kind) => shared_object_content(&txn, name, kind),
                Err(e) => {
                    log::debug!("Placeholder for {name:?} in {room:?}: {e}");
                    json!({})
                }
            };
            data.insert(name.clone(), json!({ "type": kind, "content": content }));
        }
        json!({ "room": room, "data": data })
    }

    /// POST `payload` in the background.
    pub fn deliver(&self, payload: Value) -> JoinHandle<()> {
        let request = self.client.post(&self.url).json(&payload);
        let url = self.url.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    log::debug!("Notified {url}: {}", response.status());
                }
                Ok(response) => {
                    log::warn!("Notification to {url} rejected: {}", response.status());
                }
                Err(e) => log::warn!("Notification to {url} failed: {e}"),
            }
        })
    }

    /// Debouncer that notifies about `doc` once edits settle.
    pub fn debouncer(
        self: &Arc<Self>,
        config: &NotifyConfig,
        room: String,
        doc: Arc<Mutex<Doc>>,
    ) -> Debouncer {
        let notifier = Arc::clone(self);
        Debouncer::spawn(config.debounce_wait, config.debounce_max_wait, move || {
            let payload = {
                let doc = doc.lock().unwrap_or_else(PoisonError::into_inner);
                notifier.payload(&room, &doc)
            };
            notifier.deliver(payload);
        })
    }
}

/// Trailing-edge debouncer with an upper bound on total delay.
///
/// Calls `f` once `wait` has passed without a trigger, or once `max_wait`
/// has passed since the first trigger of a burst. A pending call still runs
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Debouncer {
    triggers: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn spawn<F>(wait: Duration, max_wait: Duration, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (triggers, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_debouncer(rx, wait, max_wait.max(wait), f));
        Self { triggers }
    }

    pub fn trigger(&self) {
        let _ = self.triggers.send(());
    }
}

async fn run_debouncer<F: FnMut()>(
    mut rx: mpsc::UnboundedReceiver<()>,
    wait: Duration,
    max_wait: Duration,
    mut f: F,
) {
    while rx.recv().await.is_some() {
        let first = Instant::now();
        let mut deadline = first + wait;
        let hard_deadline = first + max_wait;
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(()) => deadline = Instant::now() + wait,
                    None => {
                        f();
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline.min(hard_deadline)) => {
                    f();
                    break;
                }
            }
        }
    }
}
