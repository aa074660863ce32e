//! Wire format of exception request and reply messages.
//!
//! Field order and widths match the MIG-generated `exc` and `mach_exc` subsystems. All
//! integers are in native byte order.

use crate::error::{Error, Result};
use crate::kernel::{KernReturn, Port, PORT_NULL};

/// `exception_raise`, with 32-bit codes.
pub const EXCEPTION_RAISE_ID: i32 = 2401;

/// `mach_exception_raise`, with 64-bit codes.
pub const MACH_EXCEPTION_RAISE_ID: i32 = 2405;

/// Reply ids are the request id plus this offset.
pub const REPLY_ID_OFFSET: i32 = 100;

/// `EXCEPTION_CODE_MAX`.
pub const CODE_MAX: usize = 2;

/// Id of the sentinel message that stops a receive loop.
pub(crate) const STOP_ID: i32 = 0x7470_7374;

pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;
pub const MACH_MSG_TYPE_MOVE_SEND: u8 = 17;
pub const MACH_MSG_TYPE_MOVE_SEND_ONCE: u32 = 18;
pub const MACH_MSG_TYPE_COPY_SEND: u32 = 19;

const MACH_MSG_PORT_DESCRIPTOR: u8 = 0;

/// `NDR_record` for a little-endian host.
const NDR_RECORD: [u8; 8] = [0, 0, 0, 0, 1, 0, 0, 0];

const BODY_OFFSET: usize = Header::SIZE;
const THREAD_DESC_OFFSET: usize = BODY_OFFSET + 4;
const TASK_DESC_OFFSET: usize = THREAD_DESC_OFFSET + DESCRIPTOR_SIZE;
const NDR_OFFSET: usize = TASK_DESC_OFFSET + DESCRIPTOR_SIZE;
const EXCEPTION_OFFSET: usize = NDR_OFFSET + NDR_RECORD.len();
const CODE_COUNT_OFFSET: usize = EXCEPTION_OFFSET + 4;
const CODES_OFFSET: usize = CODE_COUNT_OFFSET + 4;

const DESCRIPTOR_SIZE: usize = 12;

const REPLY_SIZE: usize = Header::SIZE + NDR_RECORD.len() + 4;

/// `mach_msg_header_t`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    pub bits: u32,
    pub size: u32,
    pub remote_port: Port,
    pub local_port: Port,
    pub voucher_port: Port,
    pub id: i32,
}

impl Header {
    pub const SIZE: usize = 24;

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(malformed(format!("{} bytes is too short for a header", bytes.len())));
        }

        Ok(Self {
            bits: read_u32(bytes, 0)?,
            size: read_u32(bytes, 4)?,
            remote_port: read_u32(bytes, 8)?,
            local_port: read_u32(bytes, 12)?,
            voucher_port: read_u32(bytes, 16)?,
            id: read_u32(bytes, 20)? as i32,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bits.to_ne_bytes());
        out.extend_from_slice(&self.size.to_ne_bytes());
        out.extend_from_slice(&self.remote_port.to_ne_bytes());
        out.extend_from_slice(&self.local_port.to_ne_bytes());
        out.extend_from_slice(&self.voucher_port.to_ne_bytes());
        out.extend_from_slice(&self.id.to_ne_bytes());
    }

    /// Disposition of the right in `remote_port`.
    pub fn remote_disposition(&self) -> u32 {
        self.bits & 0x1f
    }

    pub fn is_complex(&self) -> bool {
        self.bits & MACH_MSGH_BITS_COMPLEX != 0
    }
}

/// Width of the exception codes carried by a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodeWidth {
    Bits32,
    Bits64,
}

impl CodeWidth {
    pub fn for_request_id(id: i32) -> Option<Self> {
        match id {
            EXCEPTION_RAISE_ID => Some(CodeWidth::Bits32),
            MACH_EXCEPTION_RAISE_ID => Some(CodeWidth::Bits64),
            _ => None,
        }
    }

    fn bytes(self) -> usize {
        match self {
            CodeWidth::Bits32 => 4,
            CodeWidth::Bits64 => 8,
        }
    }
}

/// Exception request delivered by the kernel (`EXCEPTION_DEFAULT` behavior).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionRequest {
    pub header: Header,
    pub thread: Port,
    pub task: Port,
    pub exception: i32,
    pub codes: Vec<i64>,
}

impl ExceptionRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = Header::decode(bytes)?;

        let width = match CodeWidth::for_request_id(header.id) {
            Some(width) => width,
            None => return Err(malformed(format!("unsupported message id = {}", header.id))),
        };

        if !header.is_complex() {
            return Err(malformed("exception request is not complex".into()));
        }

        let descriptors = read_u32(bytes, BODY_OFFSET)?;
        if descriptors != 2 {
            return Err(malformed(format!("expected 2 port descriptors, found {}", descriptors)));
        }

        let thread = read_port_descriptor(bytes, THREAD_DESC_OFFSET)?;
        let task = read_port_descriptor(bytes, TASK_DESC_OFFSET)?;
        let exception = read_u32(bytes, EXCEPTION_OFFSET)? as i32;
        let count = read_u32(bytes, CODE_COUNT_OFFSET)? as usize;

        if count > CODE_MAX {
            return Err(malformed(format!("code count = {} exceeds {}", count, CODE_MAX)));
        }

        let mut codes = Vec::with_capacity(count);

        for i in 0..count {
            let offset = CODES_OFFSET + i * width.bytes();

            let code = match width {
                CodeWidth::Bits32 => i64::from(read_u32(bytes, offset)? as i32),
                CodeWidth::Bits64 => read_i64(bytes, offset)?,
            };

            codes.push(code);
        }

        Ok(Self { header, thread, task, exception, codes })
    }

    /// Encode as the kernel would deliver it. `header.id` selects the code width.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let width = match CodeWidth::for_request_id(self.header.id) {
            Some(width) => width,
            None => return Err(malformed(format!("unsupported message id = {}", self.header.id))),
        };

        if self.codes.len() > CODE_MAX {
            return Err(malformed(format!("code count = {} exceeds {}", self.codes.len(), CODE_MAX)));
        }

        let size = CODES_OFFSET + self.codes.len() * width.bytes();

        let header = Header {
            bits: self.header.bits | MACH_MSGH_BITS_COMPLEX,
            size: size as u32,
            ..self.header
        };

        let mut out = Vec::with_capacity(size);
        header.encode_into(&mut out);
        out.extend_from_slice(&2u32.to_ne_bytes());
        write_port_descriptor(&mut out, self.thread);
        write_port_descriptor(&mut out, self.task);
        out.extend_from_slice(&NDR_RECORD);
        out.extend_from_slice(&self.exception.to_ne_bytes());
        out.extend_from_slice(&(self.codes.len() as u32).to_ne_bytes());

        for &code in &self.codes {
            match width {
                CodeWidth::Bits32 => out.extend_from_slice(&(code as i32).to_ne_bytes()),
                CodeWidth::Bits64 => out.extend_from_slice(&code.to_ne_bytes()),
            }
        }

        Ok(out)
    }
}

/// Reply to an exception request, carrying a single return code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExceptionReply {
    pub header: Header,
    pub ret_code: KernReturn,
}

impl ExceptionReply {
    /// Address a reply to the sender of a request with header `request`.
    pub fn to(request: &Header, ret_code: KernReturn) -> Self {
        let header = Header {
            bits: request.remote_disposition(),
            size: REPLY_SIZE as u32,
            remote_port: request.remote_port,
            local_port: PORT_NULL,
            voucher_port: PORT_NULL,
            id: request.id + REPLY_ID_OFFSET,
        };

        Self { header, ret_code }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPLY_SIZE);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&NDR_RECORD);
        out.extend_from_slice(&self.ret_code.to_ne_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = Header::decode(bytes)?;
        let ret_code = read_u32(bytes, Header::SIZE + NDR_RECORD.len())? as i32;

        Ok(Self { header, ret_code })
    }
}

/// Port rights carried by a complex message, as far as its body can be parsed.
///
/// A request that fails to decode still moved its rights into our namespace; these
/// are the names to deallocate. At most the thread and task descriptors are read.
pub fn carried_ports(bytes: &[u8]) -> Vec<Port> {
    let complex = Header::decode(bytes).map_or(false, |header| header.is_complex());
    if !complex {
        return Vec::new();
    }

    let count = match read_u32(bytes, BODY_OFFSET) {
        Ok(count) => (count as usize).min(2),
        Err(_) => return Vec::new(),
    };

    (0..count)
        .map_while(|i| read_port_descriptor(bytes, THREAD_DESC_OFFSET + i * DESCRIPTOR_SIZE).ok())
        .filter(|&name| name != PORT_NULL)
        .collect()
}

/// Header-only sentinel asking a receive loop on `port` to stop.
pub(crate) fn stop_message(port: Port) -> Vec<u8> {
    let header = Header {
        bits: MACH_MSG_TYPE_COPY_SEND,
        size: Header::SIZE as u32,
        remote_port: port,
        local_port: PORT_NULL,
        voucher_port: PORT_NULL,
        id: STOP_ID,
    };

    let mut out = Vec::with_capacity(Header::SIZE);
    header.encode_into(&mut out);
    out
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    match bytes.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(malformed(format!("truncated at offset {}", offset))),
    }
}

fn read_i64(bytes: &[u8], offset: usize) -> Result<i64> {
    match bytes.get(offset..offset + 8) {
        Some(b) => {
            let mut word = [0u8; 8];
            word.copy_from_slice(b);
            Ok(i64::from_ne_bytes(word))
        },
        None => Err(malformed(format!("truncated at offset {}", offset))),
    }
}

fn read_port_descriptor(bytes: &[u8], offset: usize) -> Result<Port> {
    let name = read_u32(bytes, offset)?;
    let kind = read_u32(bytes, offset + 8)?;

    // `pad2: 16`, `disposition: 8`, `type: 8`.
    let ty = (kind >> 24) as u8;
    if ty != MACH_MSG_PORT_DESCRIPTOR {
        return Err(malformed(format!("descriptor type = {} is not a port", ty)));
    }

    Ok(name)
}

fn write_port_descriptor(out: &mut Vec<u8>, name: Port) {
    let kind = (u32::from(MACH_MSG_PORT_DESCRIPTOR) << 24) | (u32::from(MACH_MSG_TYPE_MOVE_SEND) << 16);

    out.extend_from_slice(&name.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out.extend_from_slice(&kind.to_ne_bytes());
}

fn malformed(reason: String) -> Error {
    Error::MalformedMessage(reason)
}
