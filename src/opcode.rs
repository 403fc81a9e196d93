use crate::error::{Result, TunnelError};

/// Stream ID carrying control frames.
pub const CONTROL_ID: u64 = 0;

/// First stream ID available to user streams. The dialer allocates even IDs
/// from 128, the acceptor odd IDs from 129; both step by 2, so the two ID
/// spaces never collide.
pub const USER_ID_START: u64 = 128;

/// Sideband values delivered on the accept queue without an actual Dial.
/// They sit above the user ID range and below nothing: any 64-bit value
/// >= 1000 that is not a live stream ID is reserved for signalling.
pub const SIGNAL_NOT_MEMBER: u64 = 1000;
pub const SIGNAL_IS_MEMBER: u64 = 1001;
pub const SIGNAL_RELOAD: u64 = 1002;

/// Control-frame opcodes.
///
/// Data frames never carry an opcode: a frame whose leading stream ID is
/// non-zero is data by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    DataConfirm,
    DataWindow,
    Connect,
    ConnectConfirm,
    Dial,
    Accept,
    Close,
    Reset,
    Ping,
    Pong,
    TunnelClose,
    TunnelCloseConfirm,
    Info,
}

impl Opcode {
    pub const DATA_CONFIRM: u64 = 1;
    pub const DATA_WINDOW: u64 = 2;
    pub const CONNECT: u64 = 3;
    pub const CONNECT_CONFIRM: u64 = 4;
    pub const DIAL: u64 = 129;
    pub const ACCEPT: u64 = 130;
    pub const CLOSE: u64 = 131;
    pub const RESET: u64 = 132;
    pub const PING: u64 = 133;
    pub const PONG: u64 = 134;
    pub const TUNNEL_CLOSE: u64 = 135;
    pub const TUNNEL_CLOSE_CONFIRM: u64 = 136;
    pub const INFO: u64 = 137;

    pub fn from_u64(v: u64) -> Result<Self> {
        match v {
            Self::DATA_CONFIRM => Ok(Opcode::DataConfirm),
            Self::DATA_WINDOW => Ok(Opcode::DataWindow),
            Self::CONNECT => Ok(Opcode::Connect),
            Self::CONNECT_CONFIRM => Ok(Opcode::ConnectConfirm),
            Self::DIAL => Ok(Opcode::Dial),
            Self::ACCEPT => Ok(Opcode::Accept),
            Self::CLOSE => Ok(Opcode::Close),
            Self::RESET => Ok(Opcode::Reset),
            Self::PING => Ok(Opcode::Ping),
            Self::PONG => Ok(Opcode::Pong),
            Self::TUNNEL_CLOSE => Ok(Opcode::TunnelClose),
            Self::TUNNEL_CLOSE_CONFIRM => Ok(Opcode::TunnelCloseConfirm),
            Self::INFO => Ok(Opcode::Info),
            other => Err(TunnelError::ProtocolError(format!(
                "unknown opcode {other}"
            ))),
        }
    }

    pub fn to_u64(self) -> u64 {
        match self {
            Opcode::DataConfirm => Self::DATA_CONFIRM,
            Opcode::DataWindow => Self::DATA_WINDOW,
            Opcode::Connect => Self::CONNECT,
            Opcode::ConnectConfirm => Self::CONNECT_CONFIRM,
            Opcode::Dial => Self::DIAL,
            Opcode::Accept => Self::ACCEPT,
            Opcode::Close => Self::CLOSE,
            Opcode::Reset => Self::RESET,
            Opcode::Ping => Self::PING,
            Opcode::Pong => Self::PONG,
            Opcode::TunnelClose => Self::TUNNEL_CLOSE,
            Opcode::TunnelCloseConfirm => Self::TUNNEL_CLOSE_CONFIRM,
            Opcode::Info => Self::INFO,
        }
    }

    /// Opcodes that reference a stream ID in their payload.
    pub fn has_stream_id(self) -> bool {
        !matches!(
            self,
            Opcode::Ping
                | Opcode::Pong
                | Opcode::TunnelClose
                | Opcode::TunnelCloseConfirm
                | Opcode::Info
        )
    }
}

/// Whether an accept-queue value is a sideband signal rather than a stream ID.
pub fn is_sideband(id: u64) -> bool {
    matches!(id, SIGNAL_NOT_MEMBER | SIGNAL_IS_MEMBER | SIGNAL_RELOAD)
}

/// Sideband signals a broker can push into the peer's accept queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The tunnel is not entitled; the peer should disconnect for good.
    NotMember,
    /// Membership confirmed; informational.
    IsMember,
    /// The peer should tear down and reconnect.
    Reload,
}

impl Signal {
    pub fn id(self) -> u64 {
        match self {
            Signal::NotMember => SIGNAL_NOT_MEMBER,
            Signal::IsMember => SIGNAL_IS_MEMBER,
            Signal::Reload => SIGNAL_RELOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        let opcodes = [
            Opcode::DataConfirm,
            Opcode::DataWindow,
            Opcode::Connect,
            Opcode::ConnectConfirm,
            Opcode::Dial,
            Opcode::Accept,
            Opcode::Close,
            Opcode::Reset,
            Opcode::Ping,
            Opcode::Pong,
            Opcode::TunnelClose,
            Opcode::TunnelCloseConfirm,
            Opcode::Info,
        ];

        for op in opcodes {
            assert_eq!(Opcode::from_u64(op.to_u64()).unwrap(), op);
        }
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(Opcode::from_u64(0).is_err());
        assert!(Opcode::from_u64(5).is_err());
        assert!(Opcode::from_u64(128).is_err());
        assert!(Opcode::from_u64(138).is_err());
        assert!(Opcode::from_u64(u64::MAX).is_err());
    }

    #[test]
    fn test_wire_values_are_stable() {
        // The values below are the wire protocol; they must never drift.
        assert_eq!(Opcode::DataConfirm.to_u64(), 1);
        assert_eq!(Opcode::DataWindow.to_u64(), 2);
        assert_eq!(Opcode::Connect.to_u64(), 3);
        assert_eq!(Opcode::ConnectConfirm.to_u64(), 4);
        assert_eq!(Opcode::Dial.to_u64(), 129);
        assert_eq!(Opcode::Accept.to_u64(), 130);
        assert_eq!(Opcode::Close.to_u64(), 131);
        assert_eq!(Opcode::Reset.to_u64(), 132);
        assert_eq!(Opcode::Ping.to_u64(), 133);
        assert_eq!(Opcode::Pong.to_u64(), 134);
        assert_eq!(Opcode::TunnelClose.to_u64(), 135);
        assert_eq!(Opcode::TunnelCloseConfirm.to_u64(), 136);
        assert_eq!(Opcode::Info.to_u64(), 137);
    }

    #[test]
    fn test_sideband_classification() {
        assert!(is_sideband(SIGNAL_NOT_MEMBER));
        assert!(is_sideband(SIGNAL_IS_MEMBER));
        assert!(is_sideband(SIGNAL_RELOAD));
        assert!(!is_sideband(CONTROL_ID));
        assert!(!is_sideband(USER_ID_START));
        assert!(!is_sideband(999));
        assert!(!is_sideband(1003));
    }

    #[test]
    fn test_has_stream_id() {
        assert!(Opcode::DataConfirm.has_stream_id());
        assert!(Opcode::Connect.has_stream_id());
        assert!(Opcode::Dial.has_stream_id());
        assert!(Opcode::Reset.has_stream_id());
        assert!(!Opcode::Ping.has_stream_id());
        assert!(!Opcode::Pong.has_stream_id());
        assert!(!Opcode::TunnelClose.has_stream_id());
        assert!(!Opcode::Info.has_stream_id());
    }
}
