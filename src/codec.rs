use crate::{
    error::{Result, TunnelError},
    frame::Frame,
    opcode::{Opcode, CONTROL_ID},
};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on any length-prefixed byte block. A peer announcing more than
/// this is malformed, not just large.
pub const MAX_BLOCK_LEN: u64 = 16 * 1024 * 1024;

/// Append `v` as an unsigned varint (7-bit groups, continuation bit on all
/// but the last).
pub fn put_uvarint(dst: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        dst.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    dst.put_u8(v as u8);
}

/// Read one unsigned varint. Fails with `ProtocolError` on a varint longer
/// than 64 bits; transport errors pass through.
pub async fn read_uvarint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = r.read_u8().await?;
        if shift == 63 && byte > 1 {
            return Err(TunnelError::ProtocolError("varint overflow".to_string()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

async fn read_block<R: AsyncRead + Unpin>(r: &mut R, len: u64) -> Result<Bytes> {
    if len > MAX_BLOCK_LEN {
        return Err(TunnelError::ProtocolError(format!(
            "byte block of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read the payload of a data frame: a length varint followed by that many
/// opaque bytes. The leading stream ID has already been consumed.
pub async fn read_data_payload<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = read_uvarint(r).await?;
    read_block(r, len).await
}

/// Decode a control frame. The leading zero stream ID has already been
/// consumed; this reads the opcode and whatever fields it implies.
pub async fn read_control<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let op = Opcode::from_u64(read_uvarint(r).await?)?;
    let frame = match op {
        Opcode::DataConfirm => Frame::DataConfirm {
            id: read_uvarint(r).await?,
            window: read_uvarint(r).await?,
        },
        Opcode::DataWindow => Frame::DataWindow {
            id: read_uvarint(r).await?,
            window: read_uvarint(r).await?,
        },
        Opcode::Connect => {
            let id = read_uvarint(r).await?;
            let len = read_uvarint(r).await?;
            Frame::Connect {
                id,
                addr: read_block(r, len).await?,
            }
        }
        Opcode::ConnectConfirm => {
            let id = read_uvarint(r).await?;
            let len = read_uvarint(r).await?;
            // Success is announced by length zero and nothing follows.
            let error = if len > 0 {
                read_block(r, len).await?
            } else {
                Bytes::new()
            };
            Frame::ConnectConfirm { id, error }
        }
        Opcode::Dial => Frame::Dial {
            id: read_uvarint(r).await?,
        },
        Opcode::Accept => Frame::Accept {
            id: read_uvarint(r).await?,
        },
        Opcode::Close => Frame::Close {
            id: read_uvarint(r).await?,
        },
        Opcode::Reset => Frame::Reset {
            id: read_uvarint(r).await?,
        },
        Opcode::Ping => Frame::Ping,
        Opcode::Pong => Frame::Pong,
        Opcode::TunnelClose => Frame::TunnelClose,
        Opcode::TunnelCloseConfirm => Frame::TunnelCloseConfirm,
        Opcode::Info => {
            let len = read_uvarint(r).await?;
            Frame::Info {
                payload: read_block(r, len).await?,
            }
        }
    };
    Ok(frame)
}

/// Read one whole frame, leading stream ID included. The engine's reader task
/// reads the leading varint itself (to scope its idle watchdog); this variant
/// exists for tests and tools.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let id = read_uvarint(r).await?;
    if id == CONTROL_ID {
        read_control(r).await
    } else {
        Ok(Frame::Data {
            id,
            payload: read_data_payload(r).await?,
        })
    }
}

/// Serialise a frame into `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Data { id, payload } => {
            put_uvarint(dst, *id);
            put_uvarint(dst, payload.len() as u64);
            dst.extend_from_slice(payload);
        }
        Frame::DataConfirm { id, window } => {
            control_header(dst, Opcode::DataConfirm);
            put_uvarint(dst, *id);
            put_uvarint(dst, *window);
        }
        Frame::DataWindow { id, window } => {
            control_header(dst, Opcode::DataWindow);
            put_uvarint(dst, *id);
            put_uvarint(dst, *window);
        }
        Frame::Connect { id, addr } => {
            control_header(dst, Opcode::Connect);
            put_uvarint(dst, *id);
            put_uvarint(dst, addr.len() as u64);
            dst.extend_from_slice(addr);
        }
        Frame::ConnectConfirm { id, error } => {
            control_header(dst, Opcode::ConnectConfirm);
            put_uvarint(dst, *id);
            put_uvarint(dst, error.len() as u64);
            // Zero-length success: only the varint header goes out.
            if !error.is_empty() {
                dst.extend_from_slice(error);
            }
        }
        Frame::Dial { id } => {
            control_header(dst, Opcode::Dial);
            put_uvarint(dst, *id);
        }
        Frame::Accept { id } => {
            control_header(dst, Opcode::Accept);
            put_uvarint(dst, *id);
        }
        Frame::Close { id } => {
            control_header(dst, Opcode::Close);
            put_uvarint(dst, *id);
        }
        Frame::Reset { id } => {
            control_header(dst, Opcode::Reset);
            put_uvarint(dst, *id);
        }
        Frame::Ping => control_header(dst, Opcode::Ping),
        Frame::Pong => control_header(dst, Opcode::Pong),
        Frame::TunnelClose => control_header(dst, Opcode::TunnelClose),
        Frame::TunnelCloseConfirm => control_header(dst, Opcode::TunnelCloseConfirm),
        Frame::Info { payload } => {
            control_header(dst, Opcode::Info);
            put_uvarint(dst, payload.len() as u64);
            dst.extend_from_slice(payload);
        }
    }
}

fn control_header(dst: &mut BytesMut, op: Opcode) {
    put_uvarint(dst, CONTROL_ID);
    put_uvarint(dst, op.to_u64());
}
