//! Socket bus: length-prefixed envelope framing over TCP.
//!
//! The write half sits behind the outbound channel so sends are
//! serialized; the read half runs a loop that decodes envelopes until the
//! peer disconnects. No OS-handle transfer on this transport.

use super::{BusEvent, BusHandle, BusKind, Outbound};
use crate::error::ActorError;
use canopy_protocol::read_envelope;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

pub(crate) fn spawn_socket_bus(stream: TcpStream) -> (BusHandle, mpsc::Receiver<BusEvent>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);
    let (evt_tx, evt_rx) = mpsc::channel::<BusEvent>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Some(Outbound { frame, fd, ack }) = out_rx.recv().await {
            if fd.is_some() {
                let _ = ack.send(Err(ActorError::Transport(
                    "socket bus cannot transfer OS handles".to_string(),
                )));
                continue;
            }
            let result = write_half
                .write_all(&frame)
                .await
                .map_err(ActorError::from);
            let failed = result.is_err();
            let _ = ack.send(result);
            if failed {
                break;
            }
        }
        // Shut the stream down so the read loop observes EOF and emits Exit.
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            match read_envelope(&mut read_half).await {
                Ok(envelope) => {
                    if evt_tx.send(BusEvent::Message(envelope, None)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!("socket bus closed: {err}");
                    break;
                }
            }
        }
        let _ = evt_tx.send(BusEvent::Exit).await;
    });

    (BusHandle::new(out_tx, BusKind::Socket), evt_rx)
}
