//! Standalone tasks that own the UDP socket halves.
//!
//! The receive task reads raw datagrams into a fixed 1280-byte buffer and
//! forwards them over a channel; the send task drains an outbound channel
//! into the socket. The service only ever sees the channel pair, which is
//! also how tests drive it without a real socket.

use crate::{metrics::METRICS, wire::MAX_PACKET_SIZE};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
};
use tracing::{debug, trace};

/// A raw datagram as read from the socket.
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    pub src: SocketAddr,
    pub payload: Vec<u8>,
}

/// A raw datagram queued for sending.
#[derive(Debug, Clone)]
pub(crate) struct OutboundDatagram {
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

/// Read errors that do not invalidate the socket; anything else shuts the
/// read loop down.
fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// The task that reads inbound UDP packets.
pub(crate) struct RecvHandler {
    socket: Arc<UdpSocket>,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    handler: mpsc::Sender<InboundDatagram>,
    exit: oneshot::Receiver<()>,
}

impl RecvHandler {
    pub(crate) fn spawn(
        socket: Arc<UdpSocket>,
        handler: mpsc::Sender<InboundDatagram>,
    ) -> oneshot::Sender<()> {
        let (exit_sender, exit) = oneshot::channel();
        let mut recv_handler = RecvHandler {
            socket,
            recv_buffer: [0; MAX_PACKET_SIZE],
            handler,
            exit,
        };
        tokio::spawn(async move {
            debug!("Recv handler starting");
            recv_handler.start().await;
        });
        exit_sender
    }

    async fn start(&mut self) {
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut self.recv_buffer) => {
                    match result {
                        Ok((length, src)) => {
                            METRICS.add_recv_bytes(length);
                            let inbound = InboundDatagram {
                                src,
                                payload: self.recv_buffer[..length].to_vec(),
                            };
                            if self.handler.send(inbound).await.is_err() {
                                break;
                            }
                        }
                        Err(err) if is_temporary(&err) => {
                            trace!(%err, "Temporary UDP read error");
                        }
                        Err(err) => {
                            debug!(%err, "UDP read error, shutting down recv handler");
                            break;
                        }
                    }
                }
                _ = &mut self.exit => {
                    debug!("Recv handler shutdown");
                    break;
                }
            }
        }
    }
}

/// The task that sends outbound UDP packets.
pub(crate) struct SendHandler {
    socket: Arc<UdpSocket>,
    outbound: mpsc::Receiver<OutboundDatagram>,
    exit: oneshot::Receiver<()>,
}

impl SendHandler {
    pub(crate) fn spawn(
        socket: Arc<UdpSocket>,
        outbound: mpsc::Receiver<OutboundDatagram>,
    ) -> oneshot::Sender<()> {
        let (exit_sender, exit) = oneshot::channel();
        let mut send_handler = SendHandler {
            socket,
            outbound,
            exit,
        };
        tokio::spawn(async move {
            debug!("Send handler starting");
            send_handler.start().await;
        });
        exit_sender
    }

    async fn start(&mut self) {
        loop {
            tokio::select! {
                outbound = self.outbound.recv() => {
                    let Some(OutboundDatagram { dst, payload }) = outbound else {
                        break;
                    };
                    match self.socket.send_to(&payload, &dst).await {
                        Ok(sent) => METRICS.add_sent_bytes(sent),
                        // UDP sends are fire-and-forget; a failed write only
                        // costs us this packet.
                        Err(err) => trace!(%err, %dst, "UDP send failed"),
                    }
                }
                _ = &mut self.exit => {
                    debug!("Send handler shutdown");
                    break;
                }
            }
        }
    }
}
