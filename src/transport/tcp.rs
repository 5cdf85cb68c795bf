//! TCP transport.
//!
//! Each stream is wrapped in a [`Framed`] [`PacketCodec`] and split. One tokio
//! task drains outbound payloads into the sink; another forwards decoded
//! packets to the connection. The connection sees a [`ChannelTransport`].
//! Both functions must be called inside a tokio runtime.

use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::Result;
use crate::transport::ChannelTransport;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

#[instrument(skip(addr))]
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<ChannelTransport> {
    let stream = TcpStream::connect(addr).await?;
    let peer = stream.peer_addr()?;
    info!(%peer, "Connected");
    spawn_pumps(stream, peer)
}

pub async fn listen<A: ToSocketAddrs>(addr: A) -> Result<TcpAcceptor> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Listening");
    Ok(TcpAcceptor { listener })
}

#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next peer
    pub async fn accept(&self) -> Result<ChannelTransport> {
        let (stream, peer) = self.listener.accept().await?;
        info!(%peer, "Accepted connection");
        spawn_pumps(stream, peer)
    }
}

fn spawn_pumps(stream: TcpStream, peer: SocketAddr) -> Result<ChannelTransport> {
    stream.set_nodelay(true)?;
    let (mut sink, mut source) = Framed::new(stream, PacketCodec).split();
    let (out_tx, mut out_rx) = unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            if let Err(e) = sink.send(Packet::new(payload)).await {
                warn!(%peer, error = %e, "Write failed");
                return;
            }
        }
        // Sender dropped: the connection closed its side.
        if let Err(e) = sink.close().await {
            debug!(%peer, error = %e, "Shutdown after close failed");
        }
    });

    tokio::spawn(async move {
        while let Some(item) = source.next().await {
            match item {
                Ok(packet) => {
                    if in_tx.send(packet.payload).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "Read failed");
                    break;
                }
            }
        }
        debug!(%peer, "Reader finished");
    });

    Ok(ChannelTransport::from_parts(out_tx, in_rx, format!("tcp:{peer}")))
}
