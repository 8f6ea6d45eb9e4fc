//! A minimal demand-driven stream abstraction: a consumer asks a [Source] for the next item, and
//!  the source answers with either an item or a terminal [End] value. Nothing is produced without
//!  a read, which is what gives the mesh its end-to-end backpressure.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::MeshError;


/// Terminal value of a stream: either regular completion or an error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum End {
    Done,
    Error(MeshError),
}
impl End {
    pub fn is_error(&self) -> bool {
        matches!(self, End::Error(_))
    }

    pub fn error(&self) -> Option<&MeshError> {
        match self {
            End::Done => None,
            End::Error(e) => Some(e),
        }
    }
}
impl From<MeshError> for End {
    fn from(value: MeshError) -> Self {
        End::Error(value)
    }
}


#[async_trait]
pub trait Source<T: Send + 'static>: Send {
    /// Reads the next item. Passing `Some(abort)` asks the source to terminate; it answers with
    ///  `Err(abort)` once it has released its resources.
    async fn read(&mut self, abort: Option<End>) -> Result<T, End>;
}

#[async_trait]
pub trait Sink<T: Send + 'static>: Send {
    /// Pulls from `source` until it yields a terminal value.
    async fn drain(self: Box<Self>, source: BoxSource<T>);
}

pub type BoxSource<T> = Box<dyn Source<T>>;
pub type BoxSink<T> = Box<dyn Sink<T>>;


/// A pair of a readable and a writable side, e.g. an application handler that both produces and
///  consumes items on a stream.
pub struct Duplex<T: Send + 'static> {
    pub source: BoxSource<T>,
    pub sink: BoxSink<T>,
}
impl <T: Send + 'static> Duplex<T> {
    pub fn new(source: BoxSource<T>, sink: BoxSink<T>) -> Duplex<T> {
        Duplex { source, sink }
    }
}
impl <T: Send + 'static> Debug for Duplex<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Duplex")
    }
}


/// Spawns a task that drains `source` into `sink`.
pub fn pipe<T: Send + 'static>(source: BoxSource<T>, sink: BoxSink<T>) -> JoinHandle<()> {
    tokio::spawn(sink.drain(source))
}


struct ValuesSource<T> {
    items: VecDeque<T>,
    end: Option<End>,
}
#[async_trait]
impl <T: Send + 'static> Source<T> for ValuesSource<T> {
    async fn read(&mut self, abort: Option<End>) -> Result<T, End> {
        if let Some(end) = &self.end {
            return Err(end.clone());
        }
        if let Some(abort) = abort {
            self.items.clear();
            self.end = Some(abort.clone());
            return Err(abort);
        }
        match self.items.pop_front() {
            Some(item) => Ok(item),
            None => {
                self.end = Some(End::Done);
                Err(End::Done)
            }
        }
    }
}

/// A source yielding the given items, followed by [End::Done].
pub fn values<T: Send + 'static>(items: impl IntoIterator<Item=T>) -> BoxSource<T> {
    Box::new(ValuesSource {
        items: items.into_iter().collect(),
        end: None,
    })
}

/// A source that terminates immediately with the given value.
pub fn empty<T: Send + 'static>(end: End) -> BoxSource<T> {
    Box::new(ValuesSource {
        items: VecDeque::new(),
        end: Some(end),
    })
}


/// Reads `source` to its end, returning the items and the terminal value.
pub async fn drain_all<T: Send + 'static>(mut source: BoxSource<T>) -> (Vec<T>, End) {
    let mut items = Vec::new();
    loop {
        match source.read(None).await {
            Ok(item) => items.push(item),
            Err(end) => return (items, end),
        }
    }
}


struct CollectSink<T> {
    result: oneshot::Sender<(Vec<T>, End)>,
}
#[async_trait]
impl <T: Send + 'static> Sink<T> for CollectSink<T> {
    async fn drain(self: Box<Self>, source: BoxSource<T>) {
        let collected = drain_all(source).await;
        let _ = self.result.send(collected);
    }
}

/// A sink that collects everything it reads. The receiver resolves once the source terminated.
pub fn collect<T: Send + 'static>() -> (BoxSink<T>, oneshot::Receiver<(Vec<T>, End)>) {
    let (result, receiver) = oneshot::channel();
    (Box::new(CollectSink { result }), receiver)
}


/// The writing half of a [pushable] source.
pub struct Pusher<T> {
    sender: mpsc::UnboundedSender<Result<T, End>>,
}
impl <T> Clone for Pusher<T> {
    fn clone(&self) -> Self {
        Pusher { sender: self.sender.clone() }
    }
}
impl <T> Pusher<T> {
    /// returns `false` if the reading side is gone
    pub fn push(&self, item: T) -> bool {
        self.sender.send(Ok(item)).is_ok()
    }

    pub fn end(&self, end: End) {
        let _ = self.sender.send(Err(end));
    }
}

pub struct PushableSource<T> {
    receiver: mpsc::UnboundedReceiver<Result<T, End>>,
    ended: Option<End>,
}
#[async_trait]
impl <T: Send + 'static> Source<T> for PushableSource<T> {
    async fn read(&mut self, abort: Option<End>) -> Result<T, End> {
        if let Some(end) = &self.ended {
            return Err(end.clone());
        }
        if let Some(abort) = abort {
            self.receiver.close();
            self.ended = Some(abort.clone());
            return Err(abort);
        }

        let end = match self.receiver.recv().await {
            Some(Ok(item)) => return Ok(item),
            Some(Err(end)) => end,
            None => End::Done,
        };
        self.ended = Some(end.clone());
        Err(end)
    }
}

/// A source that is fed by pushing items into it. Items are buffered without limit until read.
pub fn pushable<T: Send + 'static>() -> (Pusher<T>, PushableSource<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Pusher { sender }, PushableSource { receiver, ended: None })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_then_done() {
        let (items, end) = drain_all(values(vec![1, 2, 3])).await;
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(end, End::Done);
    }

    #[tokio::test]
    async fn test_values_abort() {
        let mut source = values(vec![1, 2, 3]);
        assert_eq!(source.read(None).await, Ok(1));
        let abort = End::Error(MeshError::Remote("stop".to_string()));
        assert_eq!(source.read(Some(abort.clone())).await, Err(abort.clone()));
        assert_eq!(source.read(None).await, Err(abort));
    }

    #[tokio::test]
    async fn test_collect_via_pipe() {
        let (sink, result) = collect();
        pipe(values(vec!["a", "b"]), sink);
        assert_eq!(result.await.unwrap(), (vec!["a", "b"], End::Done));
    }

    #[tokio::test]
    async fn test_pushable() {
        let (pusher, source) = pushable();
        assert!(pusher.push(1));
        assert!(pusher.push(2));
        pusher.end(End::Error(MeshError::Remote("x".to_string())));

        let (items, end) = drain_all(Box::new(source)).await;
        assert_eq!(items, vec![1, 2]);
        assert_eq!(end, End::Error(MeshError::Remote("x".to_string())));
    }

    #[tokio::test]
    async fn test_pushable_aborted_reader() {
        let (pusher, mut source) = pushable::<u32>();
        assert_eq!(source.read(Some(End::Done)).await, Err(End::Done));
        assert!(!pusher.push(1));
    }

    #[tokio::test]
    async fn test_pushable_dropped_pusher_ends() {
        let (pusher, mut source) = pushable::<u32>();
        drop(pusher);
        assert_eq!(source.read(None).await, Err(End::Done));
    }
}
