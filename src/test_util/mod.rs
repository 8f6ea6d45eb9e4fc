//! Handlers for wiring ports in tests and small applications.

use std::time::Duration;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

use crate::node::hooks::{OpenPortHook, OpenPortResult};
use crate::port::PortOptions;
use crate::pull::{collect, values, BoxSource, Duplex, End, Source};


pub type Collected = oneshot::Receiver<(Vec<Value>, End)>;

/// A handler that produces `items` and collects whatever it receives.
pub fn create_duplex(items: Vec<Value>) -> (Duplex<Value>, Collected) {
    let (sink, collected) = collect();
    (Duplex::new(values(items), sink), collected)
}

/// Like [create_duplex], but every item is produced only after `delay`.
pub fn create_delayed_duplex(items: Vec<Value>, delay: Duration) -> (Duplex<Value>, Collected) {
    let (sink, collected) = collect();
    let source = Box::new(DelayedSource {
        inner: values(items),
        delay,
    });
    (Duplex::new(source, sink), collected)
}

struct DelayedSource {
    inner: BoxSource<Value>,
    delay: Duration,
}

#[async_trait]
impl Source<Value> for DelayedSource {
    async fn read(&mut self, abort: Option<End>) -> Result<Value, End> {
        if abort.is_none() {
            sleep(self.delay).await;
        }
        self.inner.read(abort).await
    }
}


/// A hook accepting every circuit to `dest_uri` with a handler that produces `items` after
///  `delay` each.
pub struct ServingHook {
    dest_uri: String,
    items: Vec<Value>,
    delay: Option<Duration>,
    port_options: Option<PortOptions>,
    collected: mpsc::UnboundedSender<Collected>,
}

impl ServingHook {
    pub fn with_delay(mut self, delay: Duration) -> ServingHook {
        self.delay = Some(delay);
        self
    }

    pub fn with_port_options(mut self, port_options: PortOptions) -> ServingHook {
        self.port_options = Some(port_options);
        self
    }
}

#[async_trait]
impl OpenPortHook for ServingHook {
    async fn open_port(&self, _source_uri: &str, dest_uri: &str) -> Option<OpenPortResult> {
        if dest_uri != self.dest_uri {
            return None;
        }

        let (stream, collected) = match self.delay {
            Some(delay) => create_delayed_duplex(self.items.clone(), delay),
            None => create_duplex(self.items.clone()),
        };
        let _ = self.collected.send(collected);
        Some(OpenPortResult {
            stream,
            port_options: self.port_options.clone(),
        })
    }
}

/// Returns the hook, and a receiver that yields one [Collected] per circuit the hook accepted.
pub fn serving_hook(dest_uri: &str, items: Vec<Value>) -> (ServingHook, mpsc::UnboundedReceiver<Collected>) {
    let (collected, collected_recv) = mpsc::unbounded_channel();
    let hook = ServingHook {
        dest_uri: dest_uri.to_string(),
        items,
        delay: None,
        port_options: None,
        collected,
    };
    (hook, collected_recv)
}
