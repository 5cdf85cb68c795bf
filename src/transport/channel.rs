//! In-memory transport over unbounded tokio channels.
//!
//! `send` and `try_recv` on tokio's unbounded channels never block and need
//! no runtime, so the same type serves plain threads and async pumps.

use crate::error::{constants, ProtocolError, Result};
use crate::transport::Transport;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

#[derive(Debug)]
pub struct ChannelTransport {
    tx: Option<UnboundedSender<Vec<u8>>>,
    rx: UnboundedReceiver<Vec<u8>>,
    label: String,
}

impl ChannelTransport {
    /// Two transports wired to each other
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded_channel();
        let (b_tx, a_rx) = unbounded_channel();
        (
            Self::from_parts(a_tx, a_rx, "memory:a"),
            Self::from_parts(b_tx, b_rx, "memory:b"),
        )
    }

    pub fn from_parts(
        tx: UnboundedSender<Vec<u8>>,
        rx: UnboundedReceiver<Vec<u8>>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            tx: Some(tx),
            rx,
            label: label.into(),
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(ProtocolError::Disconnected)?;
        tx.send(payload).map_err(|_| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                constants::ERR_CONNECTION_CLOSED,
            ))
        })
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                constants::ERR_CONNECTION_CLOSED,
            ))),
        }
    }

    fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!(peer = %self.label, "Transport closed");
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
