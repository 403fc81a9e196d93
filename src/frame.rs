use crate::opcode::Opcode;
use bytes::Bytes;

/// A single wire frame, control or data.
///
/// Data frames address a user stream directly; everything else travels on the
/// reserved control stream. `ConnectConfirm` reports success with an empty
/// error payload, in which case no byte block follows the header on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { id: u64, payload: Bytes },
    DataConfirm { id: u64, window: u64 },
    DataWindow { id: u64, window: u64 },
    Connect { id: u64, addr: Bytes },
    ConnectConfirm { id: u64, error: Bytes },
    Dial { id: u64 },
    Accept { id: u64 },
    Close { id: u64 },
    Reset { id: u64 },
    Ping,
    Pong,
    TunnelClose,
    TunnelCloseConfirm,
    Info { payload: Bytes },
}

impl Frame {
    pub fn data(id: u64, payload: Bytes) -> Self {
        Frame::Data { id, payload }
    }

    pub fn connect(id: u64, addr: &str) -> Self {
        Frame::Connect {
            id,
            addr: Bytes::copy_from_slice(addr.as_bytes()),
        }
    }

    /// A successful confirm carries no error text.
    pub fn connect_ok(id: u64) -> Self {
        Frame::ConnectConfirm {
            id,
            error: Bytes::new(),
        }
    }

    pub fn connect_err(id: u64, error: &str) -> Self {
        Frame::ConnectConfirm {
            id,
            error: Bytes::copy_from_slice(error.as_bytes()),
        }
    }

    /// The opcode this frame carries on the wire; `None` for data frames.
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Frame::Data { .. } => None,
            Frame::DataConfirm { .. } => Some(Opcode::DataConfirm),
            Frame::DataWindow { .. } => Some(Opcode::DataWindow),
            Frame::Connect { .. } => Some(Opcode::Connect),
            Frame::ConnectConfirm { .. } => Some(Opcode::ConnectConfirm),
            Frame::Dial { .. } => Some(Opcode::Dial),
            Frame::Accept { .. } => Some(Opcode::Accept),
            Frame::Close { .. } => Some(Opcode::Close),
            Frame::Reset { .. } => Some(Opcode::Reset),
            Frame::Ping => Some(Opcode::Ping),
            Frame::Pong => Some(Opcode::Pong),
            Frame::TunnelClose => Some(Opcode::TunnelClose),
            Frame::TunnelCloseConfirm => Some(Opcode::TunnelCloseConfirm),
            Frame::Info { .. } => Some(Opcode::Info),
        }
    }

    /// Length of the user payload, zero for pure control frames.
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Data { payload, .. } => payload.len(),
            _ => 0,
        }
    }
}
