use crate::error::{Result, TunnelError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Registration payload exchanged once per tunnel.
///
/// The broker keys its tunnel registry on `id`. The wire form is a small JSON
/// object (`{"ID": "..."}`) so either end can evolve the payload without
/// breaking the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    #[serde(rename = "ID")]
    pub id: String,
}

impl Info {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub(crate) fn to_wire(&self) -> Bytes {
        // Serialising a struct of strings cannot fail.
        Bytes::from(serde_json::to_vec(self).expect("info serialisation"))
    }

    pub(crate) fn from_wire(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| TunnelError::ProtocolError(format!("bad info payload: {e}")))
    }
}
