//! Request and response wire shapes.
//!
//! A request is one descriptor chain: device-readable buffers first, then
//! device-writable buffers. What the readable bytes mean depends on the
//! protocol revision the device was configured with:
//!
//! ```text
//! Echo       [ payload ... ]                      -> nothing written
//! SizedDump  [ len: u32 LE ][ name bytes ... \0 ] -> nothing written
//! Greeting   (readable part ignored)              -> "Hello from virtio-memsplit\0"
//! ```

use std::fmt;

use log::{debug, log_enabled, Level};
use thiserror::Error;

use super::Protocol;
use crate::devices::virtio::queue::VirtqDesc;
use crate::memory::{GuestMemory, MemoryError};

/// Response written back by the greeting protocol, NUL included.
pub const GREETING: &[u8] = b"Hello from virtio-memsplit\0";

/// Most readable bytes gathered from one request.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Length of the sized-dump prefix.
pub const SIZE_PREFIX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Readable descriptor {index} follows a writable one")]
    Misordered { index: usize },

    #[error("Request carries no readable payload")]
    MissingPayload,

    #[error("Request payload of {len} bytes is shorter than the size prefix")]
    ShortHeader { len: usize },

    #[error("Request buffer access failed: {0}")]
    GuestMemory(#[from] MemoryError),
}

/// One guest buffer of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgBuf {
    pub addr: u64,
    pub len: u32,
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Queue the request arrived on.
    pub queue: u16,
    pub readable: Vec<SgBuf>,
    pub writable: Vec<SgBuf>,
}

impl Request {
    /// Total bytes the guest offered for reading.
    pub fn readable_len(&self) -> u64 {
        self.readable.iter().map(|b| b.len as u64).sum()
    }

    /// Total bytes the device may write back.
    pub fn writable_capacity(&self) -> u64 {
        self.writable.iter().map(|b| b.len as u64).sum()
    }
}

/// What the device makes of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// Gathered readable bytes.
    Echo(Vec<u8>),
    /// A length-prefixed, NUL-terminated name.
    SizedEcho { declared_len: u32, name: String },
    Greeting,
}

impl fmt::Display for ResponsePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponsePayload::Echo(bytes) => write!(f, "echo of {} bytes", bytes.len()),
            ResponsePayload::SizedEcho { declared_len, name } => {
                write!(f, "sized buffer {:?} (declared {} bytes)", name, declared_len)
            }
            ResponsePayload::Greeting => write!(f, "greeting"),
        }
    }
}

/// Split a chain into readable and writable buffers.
///
/// Only descriptor flags and lengths are looked at; guest memory is not
/// touched.
pub fn decode(queue: u16, descs: &[VirtqDesc]) -> Result<Request, ProtocolError> {
    let mut request = Request {
        queue,
        readable: Vec::new(),
        writable: Vec::new(),
    };

    for (index, desc) in descs.iter().enumerate() {
        let buf = SgBuf {
            addr: desc.addr,
            len: desc.len,
        };
        if desc.is_write_only() {
            request.writable.push(buf);
        } else if request.writable.is_empty() {
            request.readable.push(buf);
        } else {
            return Err(ProtocolError::Misordered { index });
        }
    }
    Ok(request)
}

/// Interpret `request` according to `protocol`.
pub fn interpret(
    request: &Request,
    protocol: Protocol,
    memory: &GuestMemory,
) -> Result<ResponsePayload, ProtocolError> {
    match protocol {
        Protocol::Echo => {
            let bytes = gather(memory, &request.readable)?;
            dump("echo", &bytes);
            Ok(ResponsePayload::Echo(bytes))
        }
        Protocol::SizedDump => {
            if request.readable.is_empty() {
                return Err(ProtocolError::MissingPayload);
            }
            let bytes = gather(memory, &request.readable)?;
            if bytes.len() < SIZE_PREFIX_LEN {
                return Err(ProtocolError::ShortHeader { len: bytes.len() });
            }

            let (prefix, rest) = bytes.split_at(SIZE_PREFIX_LEN);
            let declared_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
            let body = &rest[..rest.len().min(declared_len as usize)];
            dump("sized", body);

            let name_len = body.iter().position(|&b| b == 0).unwrap_or(body.len());
            let name = String::from_utf8_lossy(&body[..name_len]).into_owned();
            Ok(ResponsePayload::SizedEcho { declared_len, name })
        }
        Protocol::Greeting => Ok(ResponsePayload::Greeting),
    }
}

/// Write the response for `payload` into the request's writable buffers.
///
/// Returns the number of bytes written, which is what the used element
/// reports. The greeting is truncated to the writable capacity.
pub fn encode_response(
    request: &Request,
    payload: &ResponsePayload,
    memory: &GuestMemory,
) -> Result<u32, ProtocolError> {
    let response: &[u8] = match payload {
        ResponsePayload::Echo(_) | ResponsePayload::SizedEcho { .. } => return Ok(0),
        ResponsePayload::Greeting => GREETING,
    };

    let mut written = 0usize;
    for buf in &request.writable {
        if written == response.len() {
            break;
        }
        let n = (buf.len as usize).min(response.len() - written);
        memory.write(buf.addr, &response[written..written + n])?;
        written += n;
    }
    Ok(written as u32)
}

/// Copy the readable buffers out of guest memory, up to `MAX_PAYLOAD`.
fn gather(memory: &GuestMemory, bufs: &[SgBuf]) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = Vec::new();
    for buf in bufs {
        let room = MAX_PAYLOAD - bytes.len();
        let n = (buf.len as usize).min(room);
        if n > 0 {
            let start = bytes.len();
            bytes.resize(start + n, 0);
            memory.read(buf.addr, &mut bytes[start..])?;
        }
        if n < buf.len as usize {
            debug!(
                "request payload truncated to {} bytes (guest offered more)",
                MAX_PAYLOAD
            );
            break;
        }
    }
    Ok(bytes)
}

fn dump(what: &str, bytes: &[u8]) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    debug!("{} request: {} bytes", what, bytes.len());
    for (line, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        debug!("  {:04x}: {}", line * 16, hex.join(" "));
    }
}
