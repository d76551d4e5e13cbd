//! Length-prefixed frame codec.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! offset 0   i32  size     total bytes including this header, >= 16
//! offset 4   i32  flags    bit 0 = COMPLETE, others reserved
//! offset 8   i64  call_id  < 0 means one-way / unsolicited
//! offset 16  payload      (size - 16 bytes)
//! ```

use crate::error::FrameError;
use crate::iobuffer::{IoBuffer, IoBufferPool};

pub const SIZE_OFFSET: usize = 0;
pub const FLAGS_OFFSET: usize = 4;
pub const CALL_ID_OFFSET: usize = 8;
pub const HEADER_BYTES: usize = 16;

/// Flag bit marking a fully constructed frame.
pub const FLAG_COMPLETE: i32 = 1;

/// Call-id used for one-way frames that expect no correlation.
pub const ONE_WAY_CALL_ID: i64 = -1;

/// Start a frame in `buf`: zeroed size/flags, the given call id, and the
/// write position parked after the header, ready for payload writes.
pub fn init_frame(buf: &mut IoBuffer, call_id: i64) {
    buf.clear();
    buf.write_i32(0);
    buf.write_i32(0);
    buf.write_i64(call_id);
}

/// Allocate a frame from the pool and reserve its header.
pub fn new_frame(pool: &IoBufferPool, call_id: i64) -> IoBuffer {
    let mut buf = pool.allocate();
    init_frame(&mut buf, call_id);
    buf
}

/// Patch the size prefix with the buffer's current position, set the
/// COMPLETE flag and flip for reading. Must run before the buffer is
/// handed to a socket.
pub fn construct_complete(buf: &mut IoBuffer) {
    let size = buf.position();
    debug_assert!(size >= HEADER_BYTES, "frame smaller than its header");
    buf.set_i32(SIZE_OFFSET, size as i32);
    buf.set_i32(FLAGS_OFFSET, buf.get_i32(FLAGS_OFFSET) | FLAG_COMPLETE);
    buf.flip();
}

/// Correlation id of a completed frame.
pub fn call_id(buf: &IoBuffer) -> i64 {
    buf.get_i64(buf.position() + CALL_ID_OFFSET)
}

/// Stamp the correlation id into a completed frame.
pub fn set_call_id(buf: &mut IoBuffer, call_id: i64) {
    let at = buf.position() + CALL_ID_OFFSET;
    buf.set_i64(at, call_id);
}

/// Declared total size of the frame at the buffer's read position.
pub fn frame_size(buf: &IoBuffer) -> i32 {
    buf.get_i32(buf.position() + SIZE_OFFSET)
}

pub fn flags(buf: &IoBuffer) -> i32 {
    buf.get_i32(buf.position() + FLAGS_OFFSET)
}

/// Try to detach one complete frame from an accumulation buffer.
///
/// Returns `Ok(None)` while fewer than a header or a full frame is
/// buffered; a partial frame is never consumed. On success the frame is
/// copied into a fresh buffer (flipped, position 0) and `src` advances
/// past it. Header violations are reported without consuming anything;
/// the caller closes the socket.
pub fn try_decode(src: &mut IoBuffer, max_size: usize) -> Result<Option<IoBuffer>, FrameError> {
    if src.remaining() < HEADER_BYTES {
        return Ok(None);
    }
    let size = frame_size(src);
    if size < HEADER_BYTES as i32 {
        return Err(FrameError::SizeTooSmall(size));
    }
    if size as usize > max_size {
        return Err(FrameError::SizeTooLarge(size, max_size));
    }
    let size = size as usize;
    if src.remaining() < size {
        return Ok(None);
    }
    let mut frame = IoBuffer::with_capacity(size);
    frame.write_bytes(&src.as_read_slice()[..size]);
    frame.flip();
    src.set_position(src.position() + size);
    crate::metrics::FRAMES_DECODED.increment();
    Ok(Some(frame))
}

/// Payload bytes of a completed frame.
pub fn payload(buf: &IoBuffer) -> &[u8] {
    &buf.as_read_slice()[HEADER_BYTES..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulate(bytes: &[u8]) -> IoBuffer {
        let mut acc = IoBuffer::for_accumulation(bytes.len().max(16));
        let (ptr, len) = acc.spare_mut();
        assert!(len >= bytes.len());
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        acc.advance_limit(bytes.len());
        acc
    }

    #[test]
    fn construct_and_decode_round_trip() {
        let mut frame = IoBuffer::with_capacity(64);
        init_frame(&mut frame, 42);
        frame.write_i64(1000);
        construct_complete(&mut frame);
        assert_eq!(frame_size(&frame), 24);
        assert_eq!(flags(&frame) & FLAG_COMPLETE, FLAG_COMPLETE);
        assert_eq!(call_id(&frame), 42);

        let mut acc = accumulate(frame.as_read_slice());
        let decoded = try_decode(&mut acc, 1 << 20).unwrap().unwrap();
        assert_eq!(call_id(&decoded), 42);
        assert_eq!(payload(&decoded), 1000i64.to_be_bytes());
        assert_eq!(acc.remaining(), 0);
    }

    #[test]
    fn partial_header_not_consumed() {
        let mut acc = accumulate(&[0u8; HEADER_BYTES - 1]);
        assert!(try_decode(&mut acc, 1 << 20).unwrap().is_none());
        assert_eq!(acc.remaining(), HEADER_BYTES - 1);
    }

    #[test]
    fn partial_body_not_consumed() {
        let mut frame = IoBuffer::with_capacity(64);
        init_frame(&mut frame, 1);
        frame.write_bytes(&[9u8; 8]);
        construct_complete(&mut frame);
        let bytes = frame.as_read_slice();

        let mut acc = accumulate(&bytes[..bytes.len() - 1]);
        assert!(try_decode(&mut acc, 1 << 20).unwrap().is_none());
        assert_eq!(acc.remaining(), bytes.len() - 1);
    }

    #[test]
    fn empty_payload_frame_is_valid() {
        let mut frame = IoBuffer::with_capacity(16);
        init_frame(&mut frame, ONE_WAY_CALL_ID);
        construct_complete(&mut frame);
        assert_eq!(frame_size(&frame), HEADER_BYTES as i32);

        let mut acc = accumulate(frame.as_read_slice());
        let decoded = try_decode(&mut acc, 1 << 20).unwrap().unwrap();
        assert_eq!(call_id(&decoded), ONE_WAY_CALL_ID);
        assert!(payload(&decoded).is_empty());
    }

    #[test]
    fn undersized_frame_rejected() {
        let mut acc = IoBuffer::with_capacity(16);
        acc.write_i32(8);
        acc.write_i32(0);
        acc.write_i64(0);
        acc.flip();
        assert_eq!(
            try_decode(&mut acc, 1 << 20),
            Err(FrameError::SizeTooSmall(8))
        );
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut acc = IoBuffer::with_capacity(16);
        acc.write_i32(1 << 24);
        acc.write_i32(0);
        acc.write_i64(0);
        acc.flip();
        assert_eq!(
            try_decode(&mut acc, 1 << 20),
            Err(FrameError::SizeTooLarge(1 << 24, 1 << 20))
        );
    }

    #[test]
    fn pipelined_frames_decode_in_order() {
        let mut a = IoBuffer::with_capacity(32);
        init_frame(&mut a, 1);
        a.write_i32(111);
        construct_complete(&mut a);
        let mut b = IoBuffer::with_capacity(32);
        init_frame(&mut b, 2);
        b.write_i32(222);
        construct_complete(&mut b);

        let mut joined = Vec::new();
        joined.extend_from_slice(a.as_read_slice());
        joined.extend_from_slice(b.as_read_slice());
        let mut acc = accumulate(&joined);

        let first = try_decode(&mut acc, 1 << 20).unwrap().unwrap();
        let second = try_decode(&mut acc, 1 << 20).unwrap().unwrap();
        assert_eq!(call_id(&first), 1);
        assert_eq!(call_id(&second), 2);
        assert!(try_decode(&mut acc, 1 << 20).unwrap().is_none());
    }
}
