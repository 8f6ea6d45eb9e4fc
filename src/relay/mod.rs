//! A Relay is one end of a link between two nodes. It forwards the messages its node could not
//!  deliver locally, and feeds the messages arriving from the peer into its node.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::messaging::message::Message;
use crate::pull::pipe;
use crate::relay::relay_stream::RelayStream;

pub mod filters;
pub mod relay_stream;
pub mod vars;


/// Decides whether a message may pass. Returning `false` drops the message for this relay.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct RelayOptions {
    /// used for log output; a short random name is generated if this is not set
    pub name: Option<String>,
    /// relays with lower values are offered messages first; the node's default is used if this
    ///  is not set
    pub priority: Option<i32>,
    /// URI variables exchanged with the peer when the link is established
    pub vars: BTreeMap<String, String>,
    pub outgoing_filter: Option<MessageFilter>,
    pub incoming_filter: Option<MessageFilter>,
}

impl RelayOptions {
    pub fn named(name: &str) -> RelayOptions {
        RelayOptions {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> RelayOptions {
        self.priority = Some(priority);
        self
    }

    pub fn with_var(mut self, name: &str, value: &str) -> RelayOptions {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_outgoing_filter(mut self, filter: MessageFilter) -> RelayOptions {
        self.outgoing_filter = Some(filter);
        self
    }

    pub fn with_incoming_filter(mut self, filter: MessageFilter) -> RelayOptions {
        self.incoming_filter = Some(filter);
        self
    }
}

impl From<&str> for RelayOptions {
    fn from(name: &str) -> Self {
        RelayOptions::named(name)
    }
}

impl Debug for RelayOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayOptions")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("vars", &self.vars)
            .field("outgoing_filter", &self.outgoing_filter.is_some())
            .field("incoming_filter", &self.incoming_filter.is_some())
            .finish()
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum RelayEvent {
    /// the peer's vars table arrived, so messages can flow in both directions
    Connected,
    /// a message from the peer, before and after URI substitution
    Incoming { wire: Message, local: Message },
    /// a message for the peer, before and after URI substitution
    Outgoing { local: Message, wire: Message },
    /// a message from the peer that was dropped as a duplicate or by the incoming filter
    Ignored(Message),
    /// both directions of the link ended, and the relay was removed from its node
    Closed,
}


/// Connects two relays back to back, e.g. relays of two nodes in the same process.
pub fn link(a: &RelayStream, b: &RelayStream) -> anyhow::Result<()> {
    pipe(a.source()?, b.sink()?);
    pipe(b.source()?, a.sink()?);
    Ok(())
}
