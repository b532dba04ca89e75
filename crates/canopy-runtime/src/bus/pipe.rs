//! Pipe bus: parent↔worker channel over a Unix stream socket.
//!
//! One task owns the stream. Outbound frames arrive over a channel with a
//! per-send ack; inbound bytes are read on readiness so SCM_RIGHTS
//! ancillary data (transferred listening sockets) is picked up with the
//! frame bytes it accompanies. Received descriptors queue up and attach to
//! the next decoded envelope that declares a handle.

use super::{listener_from_fd, BusEvent, BusHandle, BusKind, Outbound};
use crate::error::{ActorError, Result};
use canopy_protocol::{expects_handle, FrameDecoder};
use sendfd::{RecvWithFd, SendWithFd};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;
const READ_BUF_SIZE: usize = 64 * 1024;
const MAX_FDS_PER_READ: usize = 8;

pub(crate) fn spawn_pipe_bus(stream: UnixStream) -> (BusHandle, mpsc::Receiver<BusEvent>) {
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);
    let (evt_tx, evt_rx) = mpsc::channel::<BusEvent>(CHANNEL_CAPACITY);

    tokio::spawn(run(stream, out_rx, evt_tx));

    (BusHandle::new(out_tx, BusKind::Pipe), evt_rx)
}

async fn run(
    stream: UnixStream,
    mut out_rx: mpsc::Receiver<Outbound>,
    evt_tx: mpsc::Sender<BusEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut fd_queue: VecDeque<OwnedFd> = VecDeque::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    'outer: loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(Outbound { frame, fd, ack }) = outbound else { break };
                let result = write_with_fd(&stream, &frame, fd).await;
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            ready = stream.readable() => {
                if ready.is_err() {
                    break;
                }
                let mut fd_buf = [0 as RawFd; MAX_FDS_PER_READ];
                match stream.recv_with_fd(&mut buf, &mut fd_buf) {
                    Ok((0, _)) => break, // peer closed
                    Ok((n, nfds)) => {
                        for &fd in &fd_buf[..nfds] {
                            // recv_with_fd hands us ownership of each fd
                            fd_queue.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                        decoder.extend(&buf[..n]);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(envelope)) => {
                                    let listener = if expects_handle(&envelope) {
                                        fd_queue.pop_front().and_then(listener_from_fd)
                                    } else {
                                        None
                                    };
                                    if evt_tx.send(BusEvent::Message(envelope, listener)).await.is_err() {
                                        break 'outer;
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    tracing::error!("pipe bus decode error: {err}");
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                    Err(err) => {
                        tracing::debug!("pipe bus read error: {err}");
                        break;
                    }
                }
            }
        }
    }

    let _ = evt_tx.send(BusEvent::Exit).await;
}

/// Write a full frame, attaching the descriptor (if any) to the first
/// chunk that goes out.
async fn write_with_fd(stream: &UnixStream, frame: &[u8], fd: Option<OwnedFd>) -> Result<()> {
    let fds: Vec<RawFd> = fd.iter().map(|f| f.as_raw_fd()).collect();
    let mut fds_sent = fds.is_empty();
    let mut offset = 0;

    while offset < frame.len() {
        stream
            .writable()
            .await
            .map_err(|err| ActorError::Transport(format!("pipe bus write failed: {err}")))?;

        let attach: &[RawFd] = if fds_sent { &[] } else { &fds };
        match stream.send_with_fd(&frame[offset..], attach) {
            Ok(n) => {
                if n > 0 {
                    fds_sent = true;
                }
                offset += n;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => {
                return Err(ActorError::Transport(format!(
                    "pipe bus write failed: {err}"
                )))
            }
        }
    }
    // `fd` drops here, closing our copy; the receiver owns the transfer.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_protocol::{
        handle_placeholder, ActorId, ActorMessageBody, Envelope, EnvelopePayload, HandleType,
    };
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn message(id: u64, topic: &str, message: Vec<serde_json::Value>) -> Envelope {
        Envelope::new(
            id,
            ActorId::generate(),
            EnvelopePayload::ActorMessage(ActorMessageBody {
                topic: topic.to_string(),
                message,
                marshalled_type: None,
                receive: false,
            }),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_both_directions() {
        let (a, b) = UnixStream::pair().unwrap();
        let (handle_a, mut events_a) = spawn_pipe_bus(a);
        let (handle_b, mut events_b) = spawn_pipe_bus(b);

        handle_a.send(&message(1, "ping", vec![json!(1)])).await.unwrap();
        handle_b.send(&message(2, "pong", vec![json!(2)])).await.unwrap();

        match events_b.recv().await.unwrap() {
            BusEvent::Message(env, None) => assert_eq!(env.id, 1),
            _ => panic!("expected message"),
        }
        match events_a.recv().await.unwrap() {
            BusEvent::Message(env, None) => assert_eq!(env.id, 2),
            _ => panic!("expected message"),
        }
    }

    #[tokio::test]
    async fn test_exit_on_peer_drop() {
        let (a, b) = UnixStream::pair().unwrap();
        let (handle_a, _events_a) = spawn_pipe_bus(a);
        let (_handle_b, mut events_b) = spawn_pipe_bus(b);

        drop(handle_a); // closes A's outbound channel, ending its task and the stream

        loop {
            match events_b.recv().await {
                Some(BusEvent::Exit) => break,
                Some(BusEvent::Message(..)) => continue,
                None => panic!("event stream ended without exit"),
            }
        }
    }

    #[tokio::test]
    async fn test_listener_transfer() {
        let (a, b) = UnixStream::pair().unwrap();
        let (handle_a, _events_a) = spawn_pipe_bus(a);
        let (_handle_b, mut events_b) = spawn_pipe_bus(b);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let env = message(
            5,
            "takeListener",
            vec![handle_placeholder(HandleType::TcpListener)],
        );
        handle_a.send_with_listener(&env, listener).await.unwrap();

        let received = match events_b.recv().await.unwrap() {
            BusEvent::Message(env, listener) => {
                assert_eq!(env.id, 5);
                listener.expect("listener should accompany the envelope")
            }
            BusEvent::Exit => panic!("unexpected exit"),
        };

        // The reconstructed listener must still accept connections.
        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });
        let (mut conn, _) = received.accept().await.unwrap();
        let mut read = [0u8; 2];
        conn.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"hi");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_frame_crosses_in_pieces() {
        let (a, b) = UnixStream::pair().unwrap();
        let (handle_a, _events_a) = spawn_pipe_bus(a);
        let (_handle_b, mut events_b) = spawn_pipe_bus(b);

        // Bigger than the 64 KiB read buffer, so it arrives in chunks.
        let big = "x".repeat(200 * 1024);
        handle_a
            .send(&message(9, "big", vec![json!(big)]))
            .await
            .unwrap();

        match events_b.recv().await.unwrap() {
            BusEvent::Message(env, _) => assert_eq!(env.id, 9),
            BusEvent::Exit => panic!("unexpected exit"),
        }
    }
}
