//! Splitting of I2C transfers into bridge-sized pieces.
//!
//! The bridge buffers at most one I2C transaction's worth of data, and the BLE
//! relay additionally caps every attribute write at 20 bytes. Larger transfers
//! are split into pieces; every piece except the last uses the repeated-start
//! opcode so the bus is not released between pieces.
//!
//! Register addresses are 8 bit and advance modulo 256, matching the
//! auto-increment pointer of the target devices.

/// Largest single-transfer payloads for one transport variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    /// Data bytes per write piece (the register byte is not counted).
    pub write: usize,
    /// Bytes per read piece.
    pub read: usize,
}

impl PayloadLimits {
    pub const SERIAL: PayloadLimits = PayloadLimits { write: 16, read: 32 };
    pub const BLE: PayloadLimits = PayloadLimits { write: 20, read: 20 };
}

/// One piece of a chunked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteChunk<'a> {
    pub register: u8,
    pub last: bool,
    pub bytes: &'a [u8],
}

/// One piece of a chunked read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    /// Register to point at first, or `None` to continue from the device pointer.
    pub register: Option<u8>,
    pub length: u8,
    pub last: bool,
}

fn advance(register: u8, offset: usize) -> u8 {
    register.wrapping_add((offset % 256) as u8)
}

/// Split `payload` into pieces of at most `max_payload` bytes.
///
/// An empty payload still yields one terminal piece so the register byte is
/// written.
pub fn chunk_write(register: u8, payload: &[u8], max_payload: usize) -> Vec<WriteChunk<'_>> {
    assert!(max_payload > 0, "max_payload must be positive");
    if payload.is_empty() {
        return vec![WriteChunk {
            register,
            last: true,
            bytes: payload,
        }];
    }

    let count = payload.len().div_ceil(max_payload);
    payload
        .chunks(max_payload)
        .enumerate()
        .map(|(i, bytes)| WriteChunk {
            register: advance(register, i * max_payload),
            last: i + 1 == count,
            bytes,
        })
        .collect()
}

/// Plan the reads needed to fetch `length` bytes starting at `register`.
///
/// A request that fits is a single terminal read. Otherwise the first
/// `max_payload` bytes are fetched with a repeated-start read and the rest is
/// planned again from `register + max_payload`.
pub fn chunk_read(register: Option<u8>, length: usize, max_payload: usize) -> Vec<ReadRequest> {
    assert!(
        max_payload > 0 && max_payload <= u8::MAX as usize,
        "max_payload must fit the length field"
    );
    let mut requests = Vec::with_capacity(length.div_ceil(max_payload));
    let mut offset = 0;
    while offset < length {
        let remaining = length - offset;
        let last = remaining <= max_payload;
        requests.push(ReadRequest {
            register: register.map(|r| advance(r, offset)),
            length: remaining.min(max_payload) as u8,
            last,
        });
        offset += max_payload;
    }
    requests
}
