use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::messaging::message::{Message, RelayFrame};
use crate::node::mesh_node::{NodeShared, Origin};
use crate::pull::{pushable, BoxSink, BoxSource, Duplex, End, PushableSource, Pusher, Sink, Source};
use crate::relay::vars::{merge_vars, UriReplacer};
use crate::relay::{MessageFilter, RelayEvent, RelayOptions};
use crate::util::events::EventNotifier;
use crate::util::uid::short_name;


/// URI substitution for both directions, known once the peer's vars arrived
struct Handshake {
    expanding: UriReplacer,
    collapsing: UriReplacer,
}

struct RelayState {
    handshake: Option<Handshake>,
    /// messages forwarded before the handshake completed
    pending: Vec<Message>,
    outbound: Option<Pusher<RelayFrame>>,
    outbound_source: Option<PushableSource<RelayFrame>>,
    source_ended: bool,
    sink_ended: bool,
    closed: bool,
}

pub(crate) struct RelayShared {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) priority: i32,
    vars: BTreeMap<String, String>,
    outgoing_filter: Option<MessageFilter>,
    incoming_filter: Option<MessageFilter>,
    state: Mutex<RelayState>,
    events: EventNotifier<RelayEvent>,
    node: Weak<NodeShared>,
    sink_taken: AtomicBool,
}

impl RelayShared {
    /// Consulted by the node before offering a message to this relay.
    pub fn accepts_outgoing(&self, message: &Message) -> bool {
        match &self.outgoing_filter {
            Some(filter) => filter(message),
            None => true,
        }
    }

    /// Sends a message to the peer, queueing it until the peer's vars arrive.
    pub fn forward(&self, message: &Message) {
        let mut state = self.state.lock().unwrap();
        if state.outbound.is_none() {
            trace!(relay = %self.name, "link is closed - dropping message");
            return;
        }
        if state.handshake.is_none() {
            trace!(relay = %self.name, "queueing message until the peer's vars arrive");
            state.pending.push(message.clone());
            return;
        }
        self.send_to_peer(&state, message);
    }

    fn send_to_peer(&self, state: &RelayState, message: &Message) {
        let (outbound, handshake) = match (&state.outbound, &state.handshake) {
            (Some(outbound), Some(handshake)) => (outbound, handshake),
            _ => return,
        };

        let wire = handshake.collapsing.rewrite(message);
        trace!(relay = %self.name, kind = %wire.kind(), id = %wire.id, "sending to peer");
        self.events.send_event(RelayEvent::Outgoing { local: message.clone(), wire: wire.clone() });
        outbound.push(RelayFrame::Message(wire));
    }

    fn on_peer_vars(&self, peer_vars: BTreeMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        if state.handshake.is_some() {
            warn!(relay = %self.name, "received a second vars table - ignoring it");
            return;
        }

        let merged = merge_vars(&self.vars, &peer_vars);
        debug!(relay = %self.name, "link established, vars: {:?}", merged);
        state.handshake = Some(Handshake {
            expanding: UriReplacer::expanding(&merged),
            collapsing: UriReplacer::collapsing(&merged),
        });

        self.events.send_event(RelayEvent::Connected);

        for message in std::mem::take(&mut state.pending) {
            self.send_to_peer(&state, &message);
        }
    }

    async fn receive(&self, wire: Message) {
        let local = {
            let state = self.state.lock().unwrap();
            match &state.handshake {
                Some(handshake) => handshake.expanding.rewrite(&wire),
                None => wire.clone(),
            }
        };

        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };

        if node.check_and_track_dup(&local) {
            trace!(relay = %self.name, id = %local.id, "dropping duplicate");
            self.events.send_event(RelayEvent::Ignored(local));
            return;
        }
        if let Some(filter) = &self.incoming_filter {
            if !filter(&local) {
                trace!(relay = %self.name, id = %local.id, "incoming filter rejected message");
                self.events.send_event(RelayEvent::Ignored(local));
                return;
            }
        }

        self.events.send_event(RelayEvent::Incoming { wire, local: local.clone() });
        node.broadcast(local, Origin::Relay(self.id)).await;
    }

    fn on_sink_end(&self, end: End) {
        debug!(relay = %self.name, "peer closed the link: {:?}", end);
        {
            let mut state = self.state.lock().unwrap();
            state.sink_ended = true;
            if let Some(outbound) = state.outbound.take() {
                outbound.end(end);
            }
        }
        self.check_closed();
    }

    fn on_source_end(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.source_ended {
                return;
            }
            state.source_ended = true;
            state.outbound = None;
        }
        self.check_closed();
    }

    fn check_closed(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed || !state.source_ended || !state.sink_ended {
                return;
            }
            state.closed = true;
        }

        debug!(relay = %self.name, "relay closed");
        self.events.send_event(RelayEvent::Closed);
        if let Some(node) = self.node.upgrade() {
            node.remove_relay(self.id);
        }
    }
}


/// Handle to a relay. Its source yields the frames for the peer, starting with this relay's vars
///  table, and its sink consumes the peer's frames.
#[derive(Clone)]
pub struct RelayStream {
    shared: Arc<RelayShared>,
}

impl RelayStream {
    /// Registering the relay with the node is the caller's responsibility.
    pub(crate) fn spawn(node: Arc<NodeShared>, options: RelayOptions) -> RelayStream {
        let (outbound, outbound_source) = pushable();
        outbound.push(RelayFrame::Vars(options.vars.clone()));

        let shared = Arc::new(RelayShared {
            id: node.next_relay_id(),
            name: options.name.unwrap_or_else(|| short_name(2)),
            priority: options.priority.unwrap_or(node.config.default_relay_priority),
            vars: options.vars,
            outgoing_filter: options.outgoing_filter,
            incoming_filter: options.incoming_filter,
            state: Mutex::new(RelayState {
                handshake: None,
                pending: Vec::new(),
                outbound: Some(outbound),
                outbound_source: Some(outbound_source),
                source_ended: false,
                sink_ended: false,
                closed: false,
            }),
            events: EventNotifier::new(),
            node: Arc::downgrade(&node),
            sink_taken: AtomicBool::new(false),
        });
        RelayStream { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<RelayShared> {
        &self.shared
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn priority(&self) -> i32 {
        self.shared.priority
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().unwrap().handshake.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Frames for the peer. It can be taken only once.
    pub fn source(&self) -> anyhow::Result<BoxSource<RelayFrame>> {
        let inner = self.shared.state.lock().unwrap()
            .outbound_source.take()
            .ok_or_else(|| anyhow!("source of relay {} was already taken", self.shared.name))?;
        Ok(Box::new(RelaySource { inner, shared: self.shared.clone() }))
    }

    /// Consumes the peer's frames. It can be taken only once.
    pub fn sink(&self) -> anyhow::Result<BoxSink<RelayFrame>> {
        if self.shared.sink_taken.swap(true, Ordering::AcqRel) {
            bail!("sink of relay {} was already taken", self.shared.name);
        }
        Ok(Box::new(RelaySink { shared: self.shared.clone() }))
    }

    pub fn duplex(&self) -> anyhow::Result<Duplex<RelayFrame>> {
        Ok(Duplex::new(self.source()?, self.sink()?))
    }
}


struct RelaySource {
    inner: PushableSource<RelayFrame>,
    shared: Arc<RelayShared>,
}

#[async_trait]
impl Source<RelayFrame> for RelaySource {
    async fn read(&mut self, abort: Option<End>) -> Result<RelayFrame, End> {
        let result = self.inner.read(abort).await;
        if result.is_err() {
            self.shared.on_source_end();
        }
        result
    }
}


struct RelaySink {
    shared: Arc<RelayShared>,
}

#[async_trait]
impl Sink<RelayFrame> for RelaySink {
    async fn drain(self: Box<Self>, mut source: BoxSource<RelayFrame>) {
        loop {
            match source.read(None).await {
                Ok(RelayFrame::Vars(vars)) => self.shared.on_peer_vars(vars),
                Ok(RelayFrame::Message(message)) => {
                    if self.shared.state.lock().unwrap().handshake.is_none() {
                        warn!(relay = %self.shared.name, "peer sent a message before its vars - assuming no vars");
                        self.shared.on_peer_vars(BTreeMap::new());
                    }
                    self.shared.receive(message).await;
                }
                Err(end) => {
                    self.shared.on_sink_end(end);
                    return;
                }
            }
        }
    }
}
