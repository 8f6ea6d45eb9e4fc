use std::sync::Arc;
use std::time::Duration;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::messaging::message::*;
use crate::node::mesh_node::{NodeShared, Origin};
use crate::port::port_stream::PortShared;
use crate::port::{PortCommand, PortEvent};
use crate::pull::End;
use crate::util::watchdog::Watchdog;


/// The requester asks its provider for keep-alive messages at two thirds of its read timeout,
///  rounded down to a multiple of two milliseconds.
pub fn continue_interval(read_timeout: Duration) -> Duration {
    Duration::from_millis((read_timeout.as_millis() as u64 / 3) * 2)
}

/// A port driver's view of the outside world: it creates the port's outgoing messages and posts
///  them to the node, and it arms watchdogs that report back to the driver.
pub(crate) struct PortContext {
    pub(crate) shared: Arc<PortShared>,
    node: Arc<NodeShared>,
    commands: mpsc::UnboundedSender<PortCommand>,
    read_timeout: Duration,
    /// keep-alive hint for the next request sent
    pending_cont: Option<MeshMeta>,
    peer_cont_interval: Option<Duration>,
}

impl PortContext {
    pub fn new(shared: Arc<PortShared>, node: Arc<NodeShared>, commands: mpsc::UnboundedSender<PortCommand>, read_timeout: Duration) -> PortContext {
        PortContext {
            shared,
            node,
            commands,
            read_timeout,
            pending_cont: Some(MeshMeta::with_cont(continue_interval(read_timeout))),
            peer_cont_interval: None,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// A changed read timeout is announced to the provider with the next request.
    pub fn set_read_timeout(&mut self, read_timeout: Duration) {
        self.read_timeout = read_timeout;
        self.pending_cont = Some(MeshMeta::with_cont(continue_interval(read_timeout)));
    }

    pub fn window_size(&self) -> usize {
        self.node.config.window_size
    }

    pub fn window_time(&self) -> Duration {
        self.node.config.window_time
    }

    pub fn peer_cont_interval(&self) -> Option<Duration> {
        self.peer_cont_interval
    }

    pub fn note_peer_meta(&mut self, meta: &MeshMeta) {
        if meta.cont.is_some() {
            self.peer_cont_interval = meta.cont_interval();
            trace!("peer asks for keep-alive every {:?}", self.peer_cont_interval);
        }
    }

    fn post(&self, message: Message) {
        trace!(kind = %message.kind(), id = %message.id, "posting message");
        self.node.post(message, Origin::Port(self.shared.port_id.clone()));
    }

    /// Sends an `Open` or `Req`. If `track` is set, the request becomes the port's in-flight
    ///  request, i.e. the port accepts replies to it.
    pub fn send_request(&mut self, is_open: bool, abort: Option<End>, track: bool) -> MessageId {
        let data = RequestData {
            source_uri: self.shared.source_uri.clone(),
            dest_uri: self.shared.dest_uri.clone(),
            port_id: self.shared.port_id.clone(),
            abort,
        };
        let command = if is_open { Command::Open(data) } else { Command::Req(data) };
        let mut message = Message::new(command);
        if let Some(meta) = self.pending_cont.take() {
            message = message.with_meta(meta);
        }

        let id = message.id.clone();
        if track {
            self.shared.set_in_flight(Some(id.clone()));
        }
        self.post(message);
        id
    }

    pub fn clear_in_flight(&self) {
        self.shared.set_in_flight(None);
    }

    pub fn send_res(&self, reply_id: MessageId, payload: Vec<Value>) {
        self.post(Message::new(Command::Res(ResData {
            source_uri: self.shared.source_uri.clone(),
            dest_uri: self.shared.dest_uri.clone(),
            peer_port_id: self.shared.peer_port_id().unwrap_or_default(),
            reply_id,
            payload,
        })));
    }

    pub fn send_continue(&self, reply_id: MessageId) {
        self.post(Message::new(Command::Continue(ContinueData {
            source_uri: self.shared.source_uri.clone(),
            dest_uri: self.shared.dest_uri.clone(),
            peer_port_id: self.shared.peer_port_id().unwrap_or_default(),
            reply_id,
        })));
    }

    pub fn send_end(&self, reply_id: MessageId, end: End) {
        self.post(Message::new(Command::End(EndData {
            source_uri: self.shared.source_uri.clone(),
            dest_uri: self.shared.dest_uri.clone(),
            peer_port_id: self.shared.peer_port_id().unwrap_or_default(),
            reply_id,
            end,
        })));
    }

    pub fn send_sink_end(&self, end: End) {
        self.post(Message::new(Command::SinkEnd(SinkEndData {
            source_uri: self.shared.source_uri.clone(),
            dest_uri: self.shared.dest_uri.clone(),
            port_id: self.shared.port_id.clone(),
            end,
        })));
    }

    /// Arms a watchdog for a request at the current read timeout. Expiry is reported to the
    ///  driver as [PortCommand::ReadTimeout].
    pub fn arm_watchdog(&self, request_id: &MessageId) -> Watchdog {
        let commands = self.commands.clone();
        let request_id = request_id.clone();
        self.node.ticker.arm(self.read_timeout, move || {
            let _ = commands.send(PortCommand::ReadTimeout(request_id));
        })
    }

    /// Final step of a port's life: it stops accepting messages and leaves its node.
    pub fn close(&self, end: End) {
        self.shared.mark_closed(end.clone());
        self.shared.events.send_event(PortEvent::Closed(end));
        self.node.remove_port(&self.shared.port_id);
    }
}
