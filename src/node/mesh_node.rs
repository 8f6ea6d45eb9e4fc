use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::messaging::message::{Command, Message, PortId};
use crate::node::hooks::OpenPortHook;
use crate::node::mesh_config::MeshConfig;
use crate::port::port_stream::{PortShared, PortStream};
use crate::port::PortOptions;
use crate::relay::relay_stream::{RelayShared, RelayStream};
use crate::relay::RelayOptions;
use crate::util::dup::DupSuppressor;
use crate::util::uid::short_name;
use crate::util::watchdog::WatchdogTicker;


/// where a broadcast message entered the node - it is never offered back to its origin
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Origin {
    Port(PortId),
    Relay(u64),
}
impl Origin {
    fn is_port(&self, port_id: &str) -> bool {
        matches!(self, Origin::Port(id) if id == port_id)
    }

    fn is_relay(&self, relay_id: u64) -> bool {
        matches!(self, Origin::Relay(id) if *id == relay_id)
    }
}

pub(crate) enum NodeCommand {
    Broadcast {
        message: Message,
        origin: Origin,
        /// signalled once the message was fully dispatched
        done: Option<oneshot::Sender<()>>,
    },
    AddPort(Arc<PortShared>),
    RemovePort(PortId),
    AddRelay(Arc<RelayShared>),
    RemoveRelay(u64),
    AddHook(Arc<dyn OpenPortHook>),
}

#[derive(Default)]
struct NodeStats {
    num_ports: AtomicUsize,
    num_relays: AtomicUsize,
}

/// The state that a node's ports and relays share with it.
pub(crate) struct NodeShared {
    pub(crate) name: String,
    pub(crate) config: Arc<MeshConfig>,
    commands: mpsc::UnboundedSender<NodeCommand>,
    pub(crate) ticker: WatchdogTicker,
    pub(crate) dup: Mutex<DupSuppressor>,
    stats: Arc<NodeStats>,
    next_relay_id: AtomicU64,
}

impl NodeShared {
    fn new(config: MeshConfig) -> (Arc<NodeShared>, mpsc::UnboundedReceiver<NodeCommand>) {
        let (commands, commands_recv) = mpsc::unbounded_channel();
        let name = config.name.clone().unwrap_or_else(|| short_name(3));

        let shared = Arc::new(NodeShared {
            name,
            ticker: WatchdogTicker::new(config.watchdog_check_interval),
            dup: Mutex::new(DupSuppressor::new(config.dup_age)),
            config: Arc::new(config),
            commands,
            stats: Default::default(),
            next_relay_id: AtomicU64::new(1),
        });
        (shared, commands_recv)
    }

    /// a node without a registry: everything ports and relays send to it ends up in the channel
    #[cfg(test)]
    pub(crate) fn detached(config: MeshConfig) -> (Arc<NodeShared>, mpsc::UnboundedReceiver<NodeCommand>) {
        NodeShared::new(config)
    }

    /// Queues a message for dispatch without waiting for it.
    pub fn post(&self, message: Message, origin: Origin) {
        let _ = self.commands.send(NodeCommand::Broadcast { message, origin, done: None });
    }

    /// Dispatches a message and waits until the node is done with it, so a busy node slows its
    ///  relays down.
    pub async fn broadcast(&self, message: Message, origin: Origin) {
        let (done, done_recv) = oneshot::channel();
        if self.commands.send(NodeCommand::Broadcast { message, origin, done: Some(done) }).is_ok() {
            let _ = done_recv.await;
        }
    }

    pub fn remove_port(&self, port_id: &str) {
        let _ = self.commands.send(NodeCommand::RemovePort(port_id.to_string()));
    }

    pub fn remove_relay(&self, relay_id: u64) {
        let _ = self.commands.send(NodeCommand::RemoveRelay(relay_id));
    }

    pub fn next_relay_id(&self) -> u64 {
        self.next_relay_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `true` if the message was seen recently, tracking it otherwise
    pub fn check_and_track_dup(&self, message: &Message) -> bool {
        self.dup.lock().unwrap().check_and_track(&message.id)
    }
}


/// A node is the meeting point of the ports and relays in a process. It dispatches every message
///  it receives: to the first local port that accepts it, or else to its relays.
///
/// All dispatching happens sequentially in the node's own task.
#[derive(Clone)]
pub struct MeshNode {
    shared: Arc<NodeShared>,
}

impl MeshNode {
    pub fn new(config: MeshConfig) -> anyhow::Result<MeshNode> {
        config.validate()?;
        Ok(MeshNode::start(config))
    }

    /// a node with default configuration
    pub fn named(name: &str) -> MeshNode {
        MeshNode::start(MeshConfig::named(name))
    }

    fn start(config: MeshConfig) -> MeshNode {
        let (shared, commands_recv) = NodeShared::new(config);
        info!("starting mesh node {}", shared.name);

        let registry = NodeRegistry {
            node: Arc::downgrade(&shared),
            stats: shared.stats.clone(),
            ports: Vec::new(),
            relays: Vec::new(),
            hooks: Vec::new(),
        };
        let span = info_span!("node", name = %shared.name);
        tokio::spawn(registry.run(commands_recv).instrument(span));

        MeshNode { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    /// Creates a port for the circuit from `source_uri` to `dest_uri`. The circuit is opened by
    ///  the first read from the port's source.
    pub fn create_port_stream(&self, source_uri: &str, dest_uri: &str, options: PortOptions) -> PortStream {
        let port = PortStream::spawn(self.shared.clone(), source_uri, dest_uri, options);
        debug!("created port {} from {} to {}", port.port_id(), source_uri, dest_uri);

        self.shared.stats.num_ports.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.commands.send(NodeCommand::AddPort(port.shared().clone()));
        port
    }

    pub fn create_relay_stream(&self, options: impl Into<RelayOptions>) -> RelayStream {
        let relay = RelayStream::spawn(self.shared.clone(), options.into());
        debug!("created relay {} with priority {}", relay.name(), relay.priority());

        self.shared.stats.num_relays.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.commands.send(NodeCommand::AddRelay(relay.shared().clone()));
        relay
    }

    pub fn add_open_port_hook(&self, hook: impl OpenPortHook) {
        let _ = self.shared.commands.send(NodeCommand::AddHook(Arc::new(hook)));
    }

    pub fn port_streams_len(&self) -> usize {
        self.shared.stats.num_ports.load(Ordering::Acquire)
    }

    pub fn relay_streams_len(&self) -> usize {
        self.shared.stats.num_relays.load(Ordering::Acquire)
    }
}


struct NodeRegistry {
    node: Weak<NodeShared>,
    stats: Arc<NodeStats>,
    /// in order of registration
    ports: Vec<Arc<PortShared>>,
    /// ordered by priority, ties in order of registration
    relays: Vec<Arc<RelayShared>>,
    hooks: Vec<Arc<dyn OpenPortHook>>,
}

impl NodeRegistry {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<NodeCommand>) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                NodeCommand::Broadcast { message, origin, done } => {
                    self.dispatch(message, origin).await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                NodeCommand::AddPort(port) => self.ports.push(port),
                NodeCommand::RemovePort(port_id) => {
                    let before = self.ports.len();
                    self.ports.retain(|p| p.port_id != port_id);
                    if self.ports.len() < before {
                        debug!("removed port {}", port_id);
                        self.stats.num_ports.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                NodeCommand::AddRelay(relay) => {
                    self.relays.push(relay);
                    self.relays.sort_by_key(|r| r.priority);
                }
                NodeCommand::RemoveRelay(relay_id) => {
                    let before = self.relays.len();
                    self.relays.retain(|r| r.id != relay_id);
                    if self.relays.len() < before {
                        debug!("removed relay {}", relay_id);
                        self.stats.num_relays.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                NodeCommand::AddHook(hook) => self.hooks.push(hook),
            }
        }
        debug!("node shut down");
    }

    async fn dispatch(&mut self, message: Message, origin: Origin) {
        trace!(kind = %message.kind(), id = %message.id, from = %message.source_uri(), to = %message.dest_uri(), "dispatching");

        if let Origin::Port(_) = &origin {
            if let Some(node) = self.node.upgrade() {
                node.dup.lock().unwrap().track(&message.id);
            }
        }

        if self.is_unbound_open(&message) {
            self.open_port_by_hook(&message).await;
        }

        for port in &self.ports {
            if origin.is_port(&port.port_id) {
                continue;
            }
            if port.process(&message) {
                trace!("consumed by port {}", port.port_id);
                return;
            }
        }

        for relay in &self.relays {
            if origin.is_relay(relay.id) {
                continue;
            }
            if !relay.accepts_outgoing(&message) {
                trace!(relay = %relay.name, id = %message.id, "outgoing filter rejected message");
                continue;
            }
            relay.forward(&message);
        }
    }

    /// an `Open` that no local port would accept
    fn is_unbound_open(&self, message: &Message) -> bool {
        match &message.command {
            Command::Open(d) if d.abort.is_none() && !self.hooks.is_empty() => {
                !self.ports.iter().any(|p| p.accepts_open(&d.dest_uri, &d.port_id))
            }
            _ => false,
        }
    }

    async fn open_port_by_hook(&mut self, message: &Message) {
        let source_uri = message.source_uri();
        let dest_uri = message.dest_uri();

        let mut accepted = None;
        for hook in &self.hooks {
            if let Some(result) = hook.open_port(source_uri, dest_uri).await {
                accepted = Some(result);
                break;
            }
        }
        let result = match accepted {
            Some(result) => result,
            None => {
                trace!("no hook accepted a circuit from {} to {}", source_uri, dest_uri);
                return;
            }
        };

        let node = match self.node.upgrade() {
            Some(node) => node,
            None => return,
        };
        let port = PortStream::spawn(node, dest_uri, source_uri, result.port_options.unwrap_or_default());
        debug!("hook opened port {} from {} to {}", port.port_id(), dest_uri, source_uri);

        self.ports.push(port.shared().clone());
        self.stats.num_ports.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = port.connect(result.stream) {
            warn!("error connecting hook handler: {}", e);
        }
    }
}
