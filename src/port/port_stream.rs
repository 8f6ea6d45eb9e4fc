use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info_span, trace, Instrument};

use crate::messaging::message::*;
use crate::node::mesh_node::NodeShared;
use crate::port::inbound::InboundRequester;
use crate::port::outbound::OutboundResponder;
use crate::port::port_context::PortContext;
use crate::port::{PortCommand, PortEvent, PortEventNotifier, PortOptions};
use crate::pull::{pipe, BoxSink, BoxSource, Duplex, End, Sink, Source};
use crate::util::uid::unique_id;


#[derive(Default)]
struct PortRouting {
    peer_port_id: Option<PortId>,
    in_flight: Option<MessageId>,
    connected: bool,
    closed: bool,
}

#[derive(Clone, Debug, Default)]
struct PortLifecycle {
    connected: bool,
    closed: Option<End>,
}

/// The part of a port that its node sees: the synchronous decision whether a message belongs to
///  this port, and the queue to the port's driver task.
pub(crate) struct PortShared {
    pub(crate) port_id: PortId,
    pub(crate) source_uri: String,
    pub(crate) dest_uri: String,
    routing: Mutex<PortRouting>,
    commands: mpsc::UnboundedSender<PortCommand>,
    pub(crate) events: PortEventNotifier,
    lifecycle: watch::Sender<PortLifecycle>,
    read_timeout: Mutex<Duration>,
    source_taken: AtomicBool,
    sink_taken: AtomicBool,
}

impl PortShared {
    pub fn peer_port_id(&self) -> Option<PortId> {
        self.routing.lock().unwrap().peer_port_id.clone()
    }

    pub fn set_in_flight(&self, request_id: Option<MessageId>) {
        self.routing.lock().unwrap().in_flight = request_id;
    }

    /// `true` if an `Open` from `peer_port_id` to `uri` would be accepted, without binding
    pub fn accepts_open(&self, uri: &str, peer_port_id: &str) -> bool {
        if self.source_uri != uri {
            return false;
        }
        let routing = self.routing.lock().unwrap();
        !routing.closed && routing.peer_port_id.as_deref().map_or(true, |p| p == peer_port_id)
    }

    /// Decides whether `message` belongs to this port and if so, hands it to the port's driver.
    ///  The first accepted `Open` binds the port to the sender's port id.
    pub fn process(&self, message: &Message) -> bool {
        if message.dest_uri() != self.source_uri {
            return false;
        }

        let connected_now = {
            let mut routing = self.routing.lock().unwrap();
            if routing.closed {
                return false;
            }

            let accepted = match &message.command {
                Command::Open(d) => {
                    if routing.peer_port_id.is_none() {
                        debug!(port = %self.port_id, peer = %d.port_id, "binding to peer");
                        routing.peer_port_id = Some(d.port_id.clone());
                    }
                    routing.peer_port_id.as_deref() == Some(d.port_id.as_str())
                }
                Command::Req(d) => routing.peer_port_id.as_deref() == Some(d.port_id.as_str()),
                Command::SinkEnd(d) => routing.peer_port_id.as_deref() == Some(d.port_id.as_str()),
                Command::Continue(d) => d.peer_port_id == self.port_id && routing.in_flight.as_deref() == Some(d.reply_id.as_str()),
                Command::Res(d) => Self::accept_reply(&mut routing, &self.port_id, &d.peer_port_id, &d.reply_id),
                Command::End(d) => Self::accept_reply(&mut routing, &self.port_id, &d.peer_port_id, &d.reply_id),
            };
            if !accepted {
                return false;
            }

            let connected_now = !routing.connected;
            routing.connected = true;
            connected_now
        };

        if connected_now {
            self.lifecycle.send_modify(|l| l.connected = true);
            self.events.send_event(PortEvent::Connected);
        }
        if self.commands.send(PortCommand::Mesh(message.clone())).is_err() {
            trace!("port driver is gone");
        }
        true
    }

    /// a reply is accepted once - the request is no longer in flight afterwards
    fn accept_reply(routing: &mut PortRouting, port_id: &str, peer_port_id: &str, reply_id: &str) -> bool {
        if peer_port_id == port_id && routing.in_flight.as_deref() == Some(reply_id) {
            routing.in_flight = None;
            true
        }
        else {
            false
        }
    }

    pub fn mark_closed(&self, end: End) {
        self.routing.lock().unwrap().closed = true;
        self.lifecycle.send_modify(|l| l.closed = Some(end));
    }

    fn closed_end(&self) -> End {
        self.lifecycle.borrow().closed.clone().unwrap_or(End::Done)
    }
}


/// Handle to a port. It is cheap to clone, and all clones refer to the same circuit endpoint.
#[derive(Clone)]
pub struct PortStream {
    shared: Arc<PortShared>,
}

impl PortStream {
    /// Creates the port and starts its driver task. Registering it with the node is the
    ///  caller's responsibility.
    pub(crate) fn spawn(node: Arc<NodeShared>, source_uri: &str, dest_uri: &str, options: PortOptions) -> PortStream {
        let read_timeout = options.read_timeout.unwrap_or(node.config.default_read_timeout);
        let (commands, commands_recv) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(PortLifecycle::default());

        let shared = Arc::new(PortShared {
            port_id: unique_id(),
            source_uri: source_uri.to_string(),
            dest_uri: dest_uri.to_string(),
            routing: Default::default(),
            commands: commands.clone(),
            events: PortEventNotifier::new(),
            lifecycle,
            read_timeout: Mutex::new(read_timeout),
            source_taken: AtomicBool::new(false),
            sink_taken: AtomicBool::new(false),
        });

        let span = info_span!("port", node = %node.name, uri = %source_uri, id = %shared.port_id);
        let driver = PortDriver {
            ctx: PortContext::new(shared.clone(), node, commands, read_timeout),
            commands: commands_recv,
            requester: InboundRequester::new(),
            responder: OutboundResponder::new(),
        };
        tokio::spawn(driver.run().instrument(span));

        PortStream { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<PortShared> {
        &self.shared
    }

    pub fn port_id(&self) -> &str {
        &self.shared.port_id
    }

    pub fn source_uri(&self) -> &str {
        &self.shared.source_uri
    }

    pub fn dest_uri(&self) -> &str {
        &self.shared.dest_uri
    }

    /// the id of the port at the other end of the circuit, once it is bound
    pub fn peer_port_id(&self) -> Option<PortId> {
        self.shared.peer_port_id()
    }

    /// The stream of items the peer produces. It can be taken only once.
    pub fn source(&self) -> anyhow::Result<BoxSource<Value>> {
        if self.shared.source_taken.swap(true, Ordering::AcqRel) {
            bail!("source of port {} was already taken", self.shared.port_id);
        }
        Ok(Box::new(PortSource { shared: self.shared.clone() }))
    }

    /// The sink for items sent to the peer. It can be taken only once.
    pub fn sink(&self) -> anyhow::Result<BoxSink<Value>> {
        if self.shared.sink_taken.swap(true, Ordering::AcqRel) {
            bail!("sink of port {} was already taken", self.shared.port_id);
        }
        Ok(Box::new(PortSink { shared: self.shared.clone() }))
    }

    /// Wires a local handler to the port: the handler's source feeds the peer, and the handler's
    ///  sink receives the peer's items.
    pub fn connect(&self, duplex: Duplex<Value>) -> anyhow::Result<()> {
        let source = self.source()?;
        let sink = self.sink()?;
        pipe(duplex.source, sink);
        pipe(source, duplex.sink);
        Ok(())
    }

    /// Ends both directions gracefully: an item that is currently being pulled from the local
    ///  producer is still delivered.
    pub fn end(&self, end: End) {
        let _ = self.shared.commands.send(PortCommand::End(end));
    }

    /// Ends both directions immediately.
    pub fn abort(&self, end: End) {
        let _ = self.shared.commands.send(PortCommand::Abort(end));
    }

    pub fn read_timeout(&self) -> Duration {
        *self.shared.read_timeout.lock().unwrap()
    }

    /// Changes the read timeout, including that of a request that is currently in flight.
    pub fn set_read_timeout(&self, read_timeout: Duration) {
        *self.shared.read_timeout.lock().unwrap() = read_timeout;
        let _ = self.shared.commands.send(PortCommand::SetReadTimeout(read_timeout));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lifecycle.borrow().connected
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lifecycle.borrow().closed.is_some()
    }

    /// Waits until the port is closed, returning its terminal value.
    pub async fn closed(&self) -> End {
        let mut lifecycle = self.shared.lifecycle.subscribe();
        loop {
            let closed = lifecycle.borrow_and_update().closed.clone();
            if let Some(end) = closed {
                return end;
            }
            if lifecycle.changed().await.is_err() {
                return End::Done;
            }
        }
    }
}


struct PortSource {
    shared: Arc<PortShared>,
}

#[async_trait]
impl Source<Value> for PortSource {
    async fn read(&mut self, abort: Option<End>) -> Result<Value, End> {
        let (callback, result) = oneshot::channel();
        let command = match abort {
            None => PortCommand::Read(callback),
            Some(abort) => PortCommand::ReadAbort(abort, callback),
        };
        if self.shared.commands.send(command).is_err() {
            return Err(self.shared.closed_end());
        }
        match result.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.closed_end()),
        }
    }
}


struct PortSink {
    shared: Arc<PortShared>,
}

#[async_trait]
impl Sink<Value> for PortSink {
    /// Pulls from the local producer whenever the port's driver asks for an item.
    async fn drain(self: Box<Self>, mut source: BoxSource<Value>) {
        let (demand, mut demand_recv) = mpsc::unbounded_channel();
        if self.shared.commands.send(PortCommand::AddProducer(demand)).is_err() {
            let _ = source.read(Some(self.shared.closed_end())).await;
            return;
        }

        while let Some(abort) = demand_recv.recv().await {
            let result = source.read(abort).await;
            let terminal = result.is_err();
            if self.shared.commands.send(PortCommand::Pulled(result)).is_err() || terminal {
                return;
            }
        }

        trace!("port driver stopped pulling - releasing the producer");
        let _ = source.read(Some(self.shared.closed_end())).await;
    }
}


struct PortDriver {
    ctx: PortContext,
    commands: mpsc::UnboundedReceiver<PortCommand>,
    requester: InboundRequester,
    responder: OutboundResponder,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PortDriver {
    async fn run(mut self) {
        debug!("starting port");
        loop {
            let window_deadline = self.responder.window_deadline();
            let continue_deadline = self.responder.next_continue_deadline();

            select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                _ = sleep_until_opt(window_deadline) => self.responder.on_window_elapsed(&mut self.ctx),
                _ = sleep_until_opt(continue_deadline) => self.responder.on_continue_due(&mut self.ctx),
            }

            if let Some(end) = self.check_finished() {
                debug!("port finished: {:?}", end);
                self.ctx.close(end);
                return;
            }
        }
    }

    fn on_command(&mut self, cmd: PortCommand) {
        match cmd {
            PortCommand::Mesh(message) => self.on_mesh_message(message),
            PortCommand::Read(callback) => self.requester.request(callback, &mut self.ctx),
            PortCommand::ReadAbort(abort, callback) => self.requester.request_abort(abort, callback, &mut self.ctx),
            PortCommand::AddProducer(demand) => self.responder.add_producer(demand, &mut self.ctx),
            PortCommand::Pulled(result) => self.responder.on_pulled(result, &mut self.ctx),
            PortCommand::End(end) => {
                self.responder.end_gracefully(end.clone(), &mut self.ctx);
                self.requester.close(end, &mut self.ctx);
            }
            PortCommand::Abort(end) => {
                self.responder.abort(end.clone(), &mut self.ctx);
                self.requester.close(end, &mut self.ctx);
            }
            PortCommand::SetReadTimeout(read_timeout) => {
                self.ctx.set_read_timeout(read_timeout);
                self.requester.set_read_timeout(read_timeout);
            }
            PortCommand::ReadTimeout(request_id) => self.requester.on_timeout(&request_id, &mut self.ctx),
        }
    }

    fn on_mesh_message(&mut self, message: Message) {
        trace!(kind = %message.kind(), id = %message.id, "processing message");

        let Message { id, meta, command } = message;
        match command {
            Command::Open(d) | Command::Req(d) => {
                self.ctx.note_peer_meta(&meta);
                match d.abort {
                    None => self.responder.on_request(id, &mut self.ctx),
                    Some(abort) => self.responder.on_request_abort(id, abort, &mut self.ctx),
                }
            }
            Command::Res(d) => self.requester.on_res(&d.reply_id, d.payload, &mut self.ctx),
            Command::Continue(d) => self.requester.on_continue(&d.reply_id),
            Command::End(d) => self.requester.on_end(&d.reply_id, d.end, &mut self.ctx),
            Command::SinkEnd(d) => self.requester.on_sink_end(d.end, &mut self.ctx),
        }
    }

    /// A port is finished when both directions are. An error on one side terminates the other
    ///  side as well, and a producer the peer never asked for is released once the inbound side
    ///  is done.
    fn check_finished(&mut self) -> Option<End> {
        let source_end = self.requester.finished().cloned();
        let sink_end = self.responder.finished().cloned();

        match (&source_end, &sink_end) {
            (Some(source_end), None) if source_end.is_error() || !self.responder.is_started() => {
                self.responder.abort(source_end.clone(), &mut self.ctx);
            }
            (None, Some(sink_end)) if sink_end.is_error() => {
                self.requester.close(sink_end.clone(), &mut self.ctx);
            }
            _ => {}
        }

        match (self.requester.finished(), self.responder.finished()) {
            (Some(source_end), Some(sink_end)) => {
                if source_end.is_error() {
                    Some(source_end.clone())
                }
                else {
                    Some(sink_end.clone())
                }
            }
            _ => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::sleep;
    use crate::error::MeshError;
    use crate::node::mesh_config::MeshConfig;
    use crate::node::mesh_node::NodeCommand;
    use crate::pull::{collect, values};
    use super::*;

    /// a port whose node is replaced by a channel, so the test plays the peer
    fn detached_port(options: PortOptions) -> (PortStream, mpsc::UnboundedReceiver<NodeCommand>) {
        let (node, node_recv) = NodeShared::detached(MeshConfig::new());
        (PortStream::spawn(node, "One", "Two", options), node_recv)
    }

    async fn next_posted(node_recv: &mut mpsc::UnboundedReceiver<NodeCommand>) -> Message {
        loop {
            match node_recv.recv().await {
                Some(NodeCommand::Broadcast { message, .. }) => return message,
                Some(_) => continue,
                None => panic!("node channel closed"),
            }
        }
    }

    fn peer_request(is_open: bool, abort: Option<End>) -> Message {
        let data = RequestData {
            source_uri: "Two".to_string(),
            dest_uri: "One".to_string(),
            port_id: "peer".to_string(),
            abort,
        };
        Message::new(if is_open { Command::Open(data) } else { Command::Req(data) })
            .with_meta(MeshMeta { cont: Some(10_000) })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_read_sends_open_with_cont() {
        let (port, mut node_recv) = detached_port(PortOptions::with_read_timeout(Duration::from_secs(1)));
        let mut source = port.source().unwrap();
        tokio::spawn(async move { source.read(None).await });

        let open = next_posted(&mut node_recv).await;
        assert_eq!(open.meta.cont, Some(666));
        match open.command {
            Command::Open(d) => {
                assert_eq!(d.source_uri, "One");
                assert_eq!(d.dest_uri, "Two");
                assert_eq!(d.port_id, port.port_id());
                assert_eq!(d.abort, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_binds_peer() {
        let (port, _node_recv) = detached_port(PortOptions::default());
        let mut events = port.subscribe();

        assert!(port.shared().process(&peer_request(true, None)));
        assert_eq!(port.peer_port_id(), Some("peer".to_string()));
        assert!(port.is_connected());
        assert_eq!(events.recv().await.unwrap(), PortEvent::Connected);

        let mut other = peer_request(true, None);
        if let Command::Open(d) = &mut other.command {
            d.port_id = "other".to_string();
        }
        assert!(!port.shared().process(&other));
        assert!(port.shared().process(&peer_request(false, None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_foreign_dest() {
        let (port, _node_recv) = detached_port(PortOptions::default());
        let mut msg = peer_request(true, None);
        if let Command::Open(d) = &mut msg.command {
            d.dest_uri = "Three".to_string();
        }
        assert!(!port.shared().process(&msg));
        assert_eq!(port.peer_port_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_of_window_size() {
        let (port, mut node_recv) = detached_port(PortOptions::default());
        pipe(values((1..=5).map(|i| json!(i))), port.sink().unwrap());

        let open = peer_request(true, None);
        let open_id = open.id.clone();
        assert!(port.shared().process(&open));

        match next_posted(&mut node_recv).await.command {
            Command::Res(d) => {
                assert_eq!(d.reply_id, open_id);
                assert_eq!(d.peer_port_id, "peer");
                assert_eq!(d.payload, vec![json!(1), json!(2), json!(3)]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let req = peer_request(false, None);
        let req_id = req.id.clone();
        assert!(port.shared().process(&req));
        match next_posted(&mut node_recv).await.command {
            Command::Res(d) => {
                assert_eq!(d.reply_id, req_id);
                assert_eq!(d.payload, vec![json!(4), json!(5)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match next_posted(&mut node_recv).await.command {
            Command::SinkEnd(d) => {
                assert_eq!(d.port_id, port.port_id());
                assert_eq!(d.end, End::Done);
            }
            other => panic!("unexpected {:?}", other),
        }

        let req = peer_request(false, None);
        let req_id = req.id.clone();
        assert!(port.shared().process(&req));
        match next_posted(&mut node_recv).await.command {
            Command::End(d) => {
                assert_eq!(d.reply_id, req_id);
                assert_eq!(d.end, End::Done);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushed_after_window() {
        let (port, mut node_recv) = detached_port(PortOptions::default());
        let (pusher, producer) = crate::pull::pushable();
        pipe(Box::new(producer), port.sink().unwrap());

        assert!(port.shared().process(&peer_request(true, None)));
        pusher.push(json!("a"));

        let start = Instant::now();
        match next_posted(&mut node_recv).await.command {
            Command::Res(d) => assert_eq!(d.payload, vec![json!("a")]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_for_slow_producer() {
        let (port, mut node_recv) = detached_port(PortOptions::default());
        let (_pusher, producer) = crate::pull::pushable::<Value>();
        pipe(Box::new(producer), port.sink().unwrap());

        let open = peer_request(true, None).with_meta(MeshMeta { cont: Some(100) });
        let open_id = open.id.clone();
        assert!(port.shared().process(&open));

        for _ in 0..3 {
            match next_posted(&mut node_recv).await.command {
                Command::Continue(d) => {
                    assert_eq!(d.reply_id, open_id);
                    assert_eq!(d.peer_port_id, "peer");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_abort_answers_without_sink_end() {
        let (port, mut node_recv) = detached_port(PortOptions::default());
        let (_pusher, producer) = crate::pull::pushable::<Value>();
        pipe(Box::new(producer), port.sink().unwrap());

        let open = peer_request(true, None);
        let open_id = open.id.clone();
        assert!(port.shared().process(&open));
        sleep(Duration::from_millis(10)).await;

        let abort = peer_request(false, Some(End::Done));
        let abort_id = abort.id.clone();
        assert!(port.shared().process(&abort));

        let mut answered = Vec::new();
        for _ in 0..2 {
            match next_posted(&mut node_recv).await.command {
                Command::End(d) => {
                    assert_eq!(d.end, End::Done);
                    answered.push(d.reply_id);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(answered, vec![open_id, abort_id]);
        sleep(Duration::from_millis(10)).await;
        assert!(node_recv.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let read_timeout = Duration::from_millis(500);
        let (port, mut node_recv) = detached_port(PortOptions::with_read_timeout(read_timeout));
        let (sink, result) = collect();
        pipe(port.source().unwrap(), sink);
        pipe(values(Vec::<Value>::new()), port.sink().unwrap());

        let start = Instant::now();
        let _open = next_posted(&mut node_recv).await;

        let (items, end) = result.await.unwrap();
        assert!(items.is_empty());
        assert!(start.elapsed() >= read_timeout);
        match end {
            End::Error(MeshError::ReadTimeout { timeout, .. }) => assert_eq!(timeout, read_timeout),
            other => panic!("unexpected {:?}", other),
        }
        assert!(port.closed().await.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_read_timeout_rearms_in_flight_request() {
        let (port, mut node_recv) = detached_port(PortOptions::with_read_timeout(Duration::from_secs(60)));
        let (sink, result) = collect();
        pipe(port.source().unwrap(), sink);
        let _open = next_posted(&mut node_recv).await;

        let start = Instant::now();
        port.set_read_timeout(Duration::from_millis(500));
        assert_eq!(port.read_timeout(), Duration::from_millis(500));

        let (_, end) = result.await.unwrap();
        assert!(end.error().map(MeshError::is_timeout).unwrap_or(false));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_abort() {
        let (port, mut node_recv) = detached_port(PortOptions::default());
        let mut source = port.source().unwrap();
        let reader = tokio::spawn(async move { source.read(None).await });
        let _open = next_posted(&mut node_recv).await;

        port.abort(End::Done);
        assert_eq!(reader.await.unwrap(), Err(End::Done));

        let mut kinds = Vec::new();
        for _ in 0..2 {
            let message = next_posted(&mut node_recv).await;
            kinds.push(message.kind());
            match message.command {
                Command::Req(d) => assert_eq!(d.abort, Some(End::Done)),
                Command::SinkEnd(d) => assert_eq!(d.end, End::Done),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(kinds.contains(&CommandKind::Req));
        assert!(kinds.contains(&CommandKind::SinkEnd));
        assert_eq!(port.closed().await, End::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_first_read_tells_peer() {
        let (port, mut node_recv) = detached_port(PortOptions::default());
        assert!(port.shared().process(&peer_request(true, None)));

        let mut source = port.source().unwrap();
        assert_eq!(source.read(Some(End::Done)).await, Err(End::Done));

        match next_posted(&mut node_recv).await.command {
            Command::Open(d) => {
                assert_eq!(d.port_id, port.port_id());
                assert_eq!(d.dest_uri, "Two");
                assert_eq!(d.abort, Some(End::Done));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_sink_end_resolves_read_in_flight() {
        let (port, mut node_recv) = detached_port(PortOptions::default());
        assert!(port.shared().process(&peer_request(true, None)));

        let mut source = port.source().unwrap();
        let reader = tokio::spawn(async move {
            let first = source.read(None).await;
            let second = source.read(None).await;
            (first, second)
        });
        match next_posted(&mut node_recv).await.command {
            Command::Open(d) => assert_eq!(d.abort, None),
            other => panic!("unexpected {:?}", other),
        }

        let gone = End::Error(MeshError::Remote("gone".to_string()));
        let sink_end = Message::new(Command::SinkEnd(SinkEndData {
            source_uri: "Two".to_string(),
            dest_uri: "One".to_string(),
            port_id: "peer".to_string(),
            end: gone.clone(),
        }));
        assert!(port.shared().process(&sink_end));

        let (first, second) = reader.await.unwrap();
        assert_eq!(first, Err(gone.clone()));
        assert_eq!(second, Err(gone));

        sleep(Duration::from_millis(10)).await;
        while let Ok(cmd) = node_recv.try_recv() {
            if let NodeCommand::Broadcast { message, .. } = cmd {
                assert_ne!(message.kind(), CommandKind::Req);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_taken_once() {
        let (port, _node_recv) = detached_port(PortOptions::default());
        assert!(port.source().is_ok());
        assert!(port.source().is_err());
        assert!(port.sink().is_ok());
        assert!(port.sink().is_err());
    }
}
