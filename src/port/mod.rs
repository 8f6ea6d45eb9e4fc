//! A Port is the local endpoint of one virtual circuit between a `source_uri` and a `dest_uri`.
//!  Each direction of the circuit is demand driven: the [inbound::InboundRequester] asks the peer
//!  for data on behalf of the local consumer, and the [outbound::OutboundResponder] answers the
//!  peer's requests from the local producer.

use std::time::Duration;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::messaging::message::{Message, MessageId};
use crate::pull::End;
use crate::util::events::EventNotifier;

pub(crate) mod inbound;
pub(crate) mod outbound;
pub(crate) mod port_context;
pub mod port_stream;


#[derive(Clone, Debug, Default)]
pub struct PortOptions {
    /// falls back to the node's default read timeout if not set
    pub read_timeout: Option<Duration>,
}
impl PortOptions {
    pub fn with_read_timeout(read_timeout: Duration) -> PortOptions {
        PortOptions {
            read_timeout: Some(read_timeout),
        }
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PortEvent {
    /// the first message of the peer was accepted
    Connected,
    /// both directions of the circuit are finished, and the port was removed from its node
    Closed(End),
}

pub(crate) type PortEventNotifier = EventNotifier<PortEvent>;


pub(crate) type ReadCallback = oneshot::Sender<Result<Value, End>>;

/// Everything a port's driver task reacts to.
#[derive(Debug)]
pub(crate) enum PortCommand {
    /// a message that was accepted by the port's routing decision
    Mesh(Message),
    Read(ReadCallback),
    ReadAbort(End, ReadCallback),
    /// the local producer was attached; the driver requests items by sending on this channel
    AddProducer(mpsc::UnboundedSender<Option<End>>),
    Pulled(Result<Value, End>),
    End(End),
    Abort(End),
    SetReadTimeout(Duration),
    ReadTimeout(MessageId),
}
