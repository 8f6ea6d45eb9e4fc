use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use serde_json::Value;

use crate::port::PortOptions;
use crate::pull::Duplex;


/// What a hook returns to accept an inbound circuit: the handler that is connected to the newly
///  created port.
#[derive(Debug)]
pub struct OpenPortResult {
    pub stream: Duplex<Value>,
    pub port_options: Option<PortOptions>,
}
impl OpenPortResult {
    pub fn new(stream: Duplex<Value>) -> OpenPortResult {
        OpenPortResult {
            stream,
            port_options: None,
        }
    }
}

/// Consulted when an `Open` arrives that no local port is bound to. Hooks are asked in the order
///  they were added, and the first one returning a handler wins. A port for the reverse
///  direction (`dest_uri` to `source_uri`) is then created and connected to that handler.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OpenPortHook: Send + Sync + 'static {
    async fn open_port(&self, source_uri: &str, dest_uri: &str) -> Option<OpenPortResult>;
}

#[async_trait]
impl <F> OpenPortHook for F
where F: Fn(&str, &str) -> Option<OpenPortResult> + Send + Sync + 'static
{
    async fn open_port(&self, source_uri: &str, dest_uri: &str) -> Option<OpenPortResult> {
        self(source_uri, dest_uri)
    }
}
