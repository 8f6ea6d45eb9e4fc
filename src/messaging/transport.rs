//! Runs a relay over a byte stream, e.g. a TCP connection or an in-memory pipe.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info, trace, warn};

use crate::error::MeshError;
use crate::messaging::message::RelayFrame;
use crate::messaging::wire::{encode_frame, FrameDecoder};
use crate::pull::{pipe, pushable, BoxSource, End, Pusher};
use crate::relay::relay_stream::RelayStream;


const READ_BUF_SIZE: usize = 8192;

/// Pumps frames between `relay` and `io` until both directions are finished. The relay's source
///  and sink are taken, so a relay can be run over a byte stream only once.
pub async fn run_relay_over<IO>(relay: &RelayStream, io: IO) -> anyhow::Result<()>
where IO: AsyncRead + AsyncWrite + Send + 'static
{
    let outgoing = relay.source()?;
    let (incoming, incoming_source) = pushable();
    pipe(Box::new(incoming_source), relay.sink()?);

    info!("running relay {} over byte stream", relay.name());
    let (reader, writer) = tokio::io::split(io);

    let (read_result, write_result) = tokio::join!(
        recv_loop(reader, incoming),
        send_loop(writer, outgoing),
    );
    debug!("byte stream of relay {} finished", relay.name());
    read_result?;
    write_result
}

async fn send_loop<IO: AsyncWrite>(mut writer: WriteHalf<IO>, mut outgoing: BoxSource<RelayFrame>) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    loop {
        let frame = match outgoing.read(None).await {
            Ok(frame) => frame,
            Err(end) => {
                debug!("outgoing frames ended: {:?}", end);
                writer.shutdown().await?;
                return Ok(());
            }
        };

        buf.clear();
        encode_frame(&frame, &mut buf);
        trace!("writing frame of {} bytes", buf.len());

        if let Err(e) = write_frame(&mut writer, &buf).await {
            warn!("error writing to byte stream: {}", e);
            let _ = outgoing.read(Some(End::Error(MeshError::Transport(e.to_string())))).await;
            return Err(e.into());
        }
    }
}

async fn write_frame<IO: AsyncWrite>(writer: &mut WriteHalf<IO>, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

async fn recv_loop<IO: AsyncRead>(mut reader: ReadHalf<IO>, incoming: Pusher<RelayFrame>) -> anyhow::Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let num_read = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("error reading from byte stream: {}", e);
                incoming.end(End::Error(MeshError::Transport(e.to_string())));
                return Err(e.into());
            }
        };
        if num_read == 0 {
            if decoder.buffered_len() > 0 {
                warn!("byte stream closed in the middle of a frame - discarding {} bytes", decoder.buffered_len());
            }
            incoming.end(End::Done);
            return Ok(());
        }

        decoder.push(&buf[..num_read]);
        loop {
            match decoder.try_next() {
                Ok(Some(frame)) => {
                    if !incoming.push(frame) {
                        debug!("relay stopped reading - closing byte stream");
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) if is_message_level(&e) => {
                    // the frame's bytes are consumed, so the stream is still in sync
                    warn!("skipping undecodable message on byte stream: {}", e);
                }
                Err(e) => {
                    warn!("undecodable frame on byte stream: {}", e);
                    incoming.end(End::Error(MeshError::Transport(e.to_string())));
                    return Err(e);
                }
            }
        }
    }
}

fn is_message_level(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<MeshError>(), Some(MeshError::UnknownCommand(_) | MeshError::Malformed(_)))
}


#[cfg(test)]
mod tests {
    use bytes_varint::VarIntSupportMut;
    use bytes::BufMut;
    use serde_json::json;
    use tokio::io::duplex;
    use crate::messaging::message::{Command, Message, RequestData};
    use crate::node::mesh_node::MeshNode;
    use crate::port::PortOptions;
    use crate::pull::{drain_all, values};
    use crate::relay::{RelayEvent, RelayOptions};
    use crate::test_util::serving_hook;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_circuit_over_byte_stream() {
        let a = MeshNode::named("a");
        let b = MeshNode::named("b");
        let (hook, mut collected) = serving_hook("b/svc", vec![json!(1), json!(2), json!(3), json!(4)]);
        b.add_open_port_hook(hook);

        let relay_a = a.create_relay_stream(RelayOptions::named("ab"));
        let relay_b = b.create_relay_stream(RelayOptions::named("ba"));
        let (io_a, io_b) = duplex(1024);
        let transport_a = tokio::spawn(async move { run_relay_over(&relay_a, io_a).await });
        let transport_b = tokio::spawn(async move { run_relay_over(&relay_b, io_b).await });

        let port = a.create_port_stream("a/x", "b/svc", PortOptions::default());
        pipe(values(vec![json!("hello")]), port.sink().unwrap());

        let (items, end) = drain_all(port.source().unwrap()).await;
        assert_eq!(items, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(end, End::Done);

        let (remote_items, remote_end) = collected.recv().await.unwrap().await.unwrap();
        assert_eq!(remote_items, vec![json!("hello")]);
        assert_eq!(remote_end, End::Done);

        assert!(!transport_a.is_finished());
        assert!(!transport_b.is_finished());
    }

    #[tokio::test]
    async fn test_garbage_ends_relay_with_transport_error() {
        let node = MeshNode::named("a");
        let relay = node.create_relay_stream(RelayOptions::named("r"));
        let mut events = relay.subscribe();
        let (io, mut other) = duplex(1024);

        let transport = tokio::spawn(async move { run_relay_over(&relay, io).await });
        other.write_all(&[3, b'x', b'y', b'z']).await.unwrap();
        other.shutdown().await.unwrap();

        let result = transport.await.unwrap();
        assert!(result.is_err());
        loop {
            if let RelayEvent::Closed = events.recv().await.unwrap() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_command_frame_is_skipped() {
        let node = MeshNode::named("a");
        let relay = node.create_relay_stream(RelayOptions::named("r"));
        let mut events = relay.subscribe();
        let (io, mut other) = duplex(4096);

        let transport = tokio::spawn(async move { run_relay_over(&relay, io).await });

        let mut buf = BytesMut::new();
        encode_frame(&RelayFrame::Vars(Default::default()), &mut buf);

        let bogus = json!(["id1", {}, "bogus", "a", "b", "p"]).to_string();
        buf.put_u64_varint(bogus.len() as u64);
        buf.put_slice(bogus.as_bytes());

        let open = Message::new(Command::Open(RequestData {
            source_uri: "remote/x".to_string(),
            dest_uri: "nowhere".to_string(),
            port_id: "p1".to_string(),
            abort: None,
        }));
        encode_frame(&RelayFrame::Message(open.clone()), &mut buf);
        other.write_all(&buf).await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                RelayEvent::Incoming { local, .. } => {
                    assert_eq!(local.id, open.id);
                    break;
                }
                RelayEvent::Closed => panic!("relay closed on an unknown command"),
                _ => {}
            }
        }
        assert!(!transport.is_finished());
    }
}
