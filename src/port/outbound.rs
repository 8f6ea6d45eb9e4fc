use std::collections::VecDeque;
use std::mem;
use std::time::Duration;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::messaging::message::MessageId;
use crate::port::port_context::PortContext;
use crate::pull::End;


struct PendingRequest {
    reply_id: MessageId,
    continue_interval: Option<Duration>,
    next_continue: Option<Instant>,
}

/// Serves the peer's requests from the local producer. Items are only pulled while there is an
///  unanswered request, and they are sent in batches: a batch is flushed when it is full or when
///  its first item has waited for the batching window.
///
/// Once the producer terminated, every pending (and every later) request is answered with `End`,
///  and the peer is notified by a single `SinkEnd` after all produced items were delivered.
pub(crate) struct OutboundResponder {
    producer: Option<mpsc::UnboundedSender<Option<End>>>,
    reading: bool,
    buffer: Vec<Value>,
    window_deadline: Option<Instant>,
    requests: VecDeque<PendingRequest>,
    /// end requested while a pull is in flight, applied once that pull returns
    ending: Option<End>,
    end: Option<End>,
    sink_end_sent: bool,
    peer_aborted: bool,
    started: bool,
}

impl OutboundResponder {
    pub fn new() -> OutboundResponder {
        OutboundResponder {
            producer: None,
            reading: false,
            buffer: Vec::new(),
            window_deadline: None,
            requests: Default::default(),
            ending: None,
            end: None,
            sink_end_sent: false,
            peer_aborted: false,
            started: false,
        }
    }

    /// `true` once the peer sent its first request
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// the terminal value, once it is set and everything produced was delivered
    pub fn finished(&self) -> Option<&End> {
        if self.buffer.is_empty() {
            self.end.as_ref()
        }
        else {
            None
        }
    }

    pub fn add_producer(&mut self, demand: mpsc::UnboundedSender<Option<End>>, ctx: &mut PortContext) {
        if self.producer.is_some() {
            warn!("port sink is already connected to a producer - ignoring the second one");
            let _ = demand.send(Some(End::Done));
            return;
        }
        if let Some(end) = &self.end {
            debug!("producer attached after the outbound side terminated");
            let _ = demand.send(Some(end.clone()));
            return;
        }
        self.producer = Some(demand);
        self.pull_more(ctx);
    }

    pub fn on_request(&mut self, reply_id: MessageId, ctx: &mut PortContext) {
        trace!("peer requests data: {}", reply_id);
        self.started = true;

        let continue_interval = ctx.peer_cont_interval();
        self.requests.push_back(PendingRequest {
            reply_id,
            continue_interval,
            next_continue: continue_interval.map(|i| Instant::now() + i),
        });

        if self.end.is_some() {
            self.answer_after_end(ctx);
        }
        else {
            self.flush(false, ctx);
            self.pull_more(ctx);
        }
    }

    /// The peer's consumer aborted: it is answered with its own abort value, and no `SinkEnd`
    ///  is sent.
    pub fn on_request_abort(&mut self, reply_id: MessageId, abort: End, ctx: &mut PortContext) {
        debug!("peer aborted: {:?}", abort);
        self.started = true;
        self.peer_aborted = true;
        self.requests.push_back(PendingRequest {
            reply_id,
            continue_interval: None,
            next_continue: None,
        });
        self.buffer.clear();

        if self.end.is_none() {
            self.terminate(abort, true, ctx);
        }
        else {
            self.answer_after_end(ctx);
        }
    }

    pub fn on_pulled(&mut self, result: Result<Value, End>, ctx: &mut PortContext) {
        self.reading = false;
        if self.end.is_some() {
            trace!("ignoring item pulled after termination");
            return;
        }

        match result {
            Ok(item) => {
                if self.buffer.is_empty() {
                    self.window_deadline = Some(Instant::now() + ctx.window_time());
                }
                self.buffer.push(item);

                if let Some(end) = self.ending.take() {
                    self.terminate(end, true, ctx);
                }
                else {
                    self.flush(false, ctx);
                    self.pull_more(ctx);
                }
            }
            Err(end) => {
                debug!("producer ended: {:?}", end);
                self.producer = None;
                self.terminate(end, false, ctx);
            }
        }
    }

    /// Deadline for flushing a partial batch. There is no deadline while no request is pending
    ///  since there would be nobody to send the batch to.
    pub fn window_deadline(&self) -> Option<Instant> {
        if self.requests.is_empty() {
            None
        }
        else {
            self.window_deadline
        }
    }

    pub fn on_window_elapsed(&mut self, ctx: &mut PortContext) {
        self.flush(true, ctx);
        self.pull_more(ctx);
    }

    pub fn next_continue_deadline(&self) -> Option<Instant> {
        self.requests.iter()
            .flat_map(|r| r.next_continue)
            .min()
    }

    pub fn on_continue_due(&mut self, ctx: &mut PortContext) {
        let now = Instant::now();
        for request in self.requests.iter_mut() {
            if let (Some(next), Some(interval)) = (request.next_continue, request.continue_interval) {
                if next <= now {
                    ctx.send_continue(request.reply_id.clone());
                    request.next_continue = Some(now + interval);
                }
            }
        }
    }

    /// Lets a pull that is in flight complete (and its item be delivered) before terminating.
    pub fn end_gracefully(&mut self, end: End, ctx: &mut PortContext) {
        if self.end.is_some() {
            return;
        }
        if self.reading {
            self.ending = Some(end);
        }
        else {
            self.terminate(end, true, ctx);
        }
    }

    /// Terminates immediately, discarding undelivered items.
    pub fn abort(&mut self, end: End, ctx: &mut PortContext) {
        self.buffer.clear();
        if self.end.is_none() {
            self.terminate(end, true, ctx);
        }
        else {
            self.answer_after_end(ctx);
        }
    }

    fn flush(&mut self, force: bool, ctx: &mut PortContext) {
        if self.buffer.is_empty() || self.requests.is_empty() {
            return;
        }

        let window_elapsed = self.window_deadline
            .map(|d| d <= Instant::now())
            .unwrap_or(false);

        if force || window_elapsed || self.buffer.len() >= ctx.window_size() {
            if let Some(request) = self.requests.pop_front() {
                trace!("sending batch of {} items", self.buffer.len());
                ctx.send_res(request.reply_id, mem::take(&mut self.buffer));
                self.window_deadline = None;
            }
        }
    }

    fn pull_more(&mut self, ctx: &mut PortContext) {
        if self.reading
            || self.end.is_some()
            || self.ending.is_some()
            || self.requests.is_empty()
            || self.buffer.len() >= ctx.window_size()
        {
            return;
        }

        if let Some(producer) = &self.producer {
            if producer.send(None).is_ok() {
                self.reading = true;
            }
        }
    }

    fn terminate(&mut self, end: End, abort_producer: bool, ctx: &mut PortContext) {
        if self.end.is_some() {
            return;
        }
        debug!("outbound side terminating: {:?}", end);

        self.end = Some(end.clone());
        self.ending = None;
        self.window_deadline = None;

        if abort_producer {
            if let Some(producer) = self.producer.take() {
                let _ = producer.send(Some(end));
            }
        }
        self.answer_after_end(ctx);
    }

    /// Remaining items go to the first pending request, all other requests get the terminal
    ///  value. `SinkEnd` is sent once nothing is left to deliver.
    fn answer_after_end(&mut self, ctx: &mut PortContext) {
        let end = match &self.end {
            Some(end) => end.clone(),
            None => return,
        };

        while let Some(request) = self.requests.pop_front() {
            if self.buffer.is_empty() {
                ctx.send_end(request.reply_id, end.clone());
            }
            else {
                ctx.send_res(request.reply_id, mem::take(&mut self.buffer));
            }
        }

        if self.buffer.is_empty() && !self.sink_end_sent && !self.peer_aborted {
            self.sink_end_sent = true;
            ctx.send_sink_end(end);
        }
    }
}
