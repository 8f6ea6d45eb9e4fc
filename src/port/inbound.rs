use std::collections::VecDeque;
use std::time::Duration;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::MeshError;
use crate::messaging::message::MessageId;
use crate::port::port_context::PortContext;
use crate::port::ReadCallback;
use crate::pull::End;
use crate::util::watchdog::Watchdog;


struct InFlight {
    request_id: MessageId,
    watchdog: Watchdog,
}

/// Turns local reads into mesh requests. There is at most one request in flight, and a new one
///  is only issued while the local consumer waits for data and nothing is buffered.
///
/// The first request is an `Open` (which binds the peer), all later ones are `Req`s. Every request
///  is guarded by a watchdog at the port's read timeout; the peer's `Continue` messages keep it
///  alive while the peer's producer is slow.
pub(crate) struct InboundRequester {
    buffer: VecDeque<Result<Value, End>>,
    in_flight: Option<InFlight>,
    read_callback: Option<ReadCallback>,
    opened: bool,
    /// the peer's producer is known to be terminated, so there is no point in aborting it
    remote_done: bool,
    peer_ended: Option<End>,
    finished: Option<End>,
}

impl InboundRequester {
    pub fn new() -> InboundRequester {
        InboundRequester {
            buffer: Default::default(),
            in_flight: None,
            read_callback: None,
            opened: false,
            remote_done: false,
            peer_ended: None,
            finished: None,
        }
    }

    pub fn finished(&self) -> Option<&End> {
        self.finished.as_ref()
    }

    pub fn request(&mut self, callback: ReadCallback, ctx: &mut PortContext) {
        if let Some(end) = &self.finished {
            let _ = callback.send(Err(end.clone()));
            return;
        }
        if self.read_callback.is_some() {
            warn!("overlapping read on port source - replacing the previous callback");
        }
        self.read_callback = Some(callback);
        self.drain();
        self.continue_pulling(ctx);
    }

    /// The local consumer aborts: buffered data is discarded, the peer is told to stop producing,
    ///  and the read is answered with the abort value.
    pub fn request_abort(&mut self, abort: End, callback: ReadCallback, ctx: &mut PortContext) {
        self.close(abort.clone(), ctx);
        let _ = callback.send(Err(abort));
    }

    /// Terminates this direction of the circuit, answering a pending read with `end`.
    pub fn close(&mut self, end: End, ctx: &mut PortContext) {
        if self.finished.is_some() {
            return;
        }
        debug!("closing inbound side: {:?}", end);

        self.buffer.clear();
        if self.in_flight.take().is_some() {
            ctx.clear_in_flight();
        }
        if !self.remote_done {
            ctx.send_request(!self.opened, Some(end.clone()), false);
            self.opened = true;
        }
        if let Some(callback) = self.read_callback.take() {
            let _ = callback.send(Err(end.clone()));
        }
        self.finish(end);
    }

    pub fn on_res(&mut self, reply_id: &str, payload: Vec<Value>, ctx: &mut PortContext) {
        if !self.is_in_flight(reply_id) {
            trace!("ignoring response to stale request {}", reply_id);
            return;
        }
        trace!("received {} items", payload.len());
        self.resolve(Ok(payload), ctx);
    }

    pub fn on_continue(&mut self, reply_id: &str) {
        match &self.in_flight {
            Some(in_flight) if in_flight.request_id == reply_id => {
                trace!("keep-alive for request {}", reply_id);
                in_flight.watchdog.touch();
            }
            _ => trace!("ignoring keep-alive for stale request {}", reply_id),
        }
    }

    pub fn on_end(&mut self, reply_id: &str, end: End, ctx: &mut PortContext) {
        if !self.is_in_flight(reply_id) {
            trace!("ignoring end for stale request {}", reply_id);
            return;
        }
        self.remote_done = true;
        self.resolve(Err(end), ctx);
    }

    /// The peer's producer ended: the request in flight is resolved with the terminal value, and
    ///  all reads after the buffered data yield it.
    pub fn on_sink_end(&mut self, end: End, ctx: &mut PortContext) {
        debug!("peer ended its production: {:?}", end);
        self.remote_done = true;
        self.peer_ended = Some(end.clone());
        if self.in_flight.is_some() {
            self.resolve(Err(end), ctx);
        }
        else {
            self.continue_pulling(ctx);
        }
    }

    pub fn on_timeout(&mut self, request_id: &str, ctx: &mut PortContext) {
        if !self.is_in_flight(request_id) {
            return;
        }
        debug!("request {} timed out after {:?}", request_id, ctx.read_timeout());
        let error = MeshError::ReadTimeout {
            request_id: request_id.to_string(),
            timeout: ctx.read_timeout(),
        };
        self.resolve(Err(End::Error(error)), ctx);
    }

    pub fn set_read_timeout(&mut self, read_timeout: Duration) {
        if let Some(in_flight) = &self.in_flight {
            in_flight.watchdog.rearm(read_timeout);
        }
    }

    fn is_in_flight(&self, request_id: &str) -> bool {
        matches!(&self.in_flight, Some(f) if f.request_id == request_id)
    }

    fn resolve(&mut self, result: Result<Vec<Value>, End>, ctx: &mut PortContext) {
        self.in_flight = None;
        ctx.clear_in_flight();

        match result {
            Ok(items) => self.buffer.extend(items.into_iter().map(Ok)),
            Err(end) => self.buffer.push_back(Err(end)),
        }
        self.drain();
        self.continue_pulling(ctx);
    }

    /// hands a buffered item (or terminal value) to a waiting reader
    fn drain(&mut self) {
        if self.read_callback.is_none() {
            return;
        }
        if let Some(item) = self.buffer.pop_front() {
            let terminal = item.as_ref().err().cloned();
            if let Some(callback) = self.read_callback.take() {
                let _ = callback.send(item);
            }
            if let Some(end) = terminal {
                self.finish(end);
            }
        }
    }

    fn continue_pulling(&mut self, ctx: &mut PortContext) {
        if self.read_callback.is_none() || self.finished.is_some() || !self.buffer.is_empty() {
            return;
        }

        if let Some(end) = self.peer_ended.clone() {
            if let Some(callback) = self.read_callback.take() {
                let _ = callback.send(Err(end.clone()));
            }
            self.finish(end);
            return;
        }

        if self.in_flight.is_none() {
            let is_open = !self.opened;
            self.opened = true;
            let request_id = ctx.send_request(is_open, None, true);
            let watchdog = ctx.arm_watchdog(&request_id);
            self.in_flight = Some(InFlight { request_id, watchdog });
        }
    }

    fn finish(&mut self, end: End) {
        debug!("inbound side finished: {:?}", end);
        self.buffer.clear();
        self.in_flight = None;
        self.finished = Some(end);
    }
}
