//! Per-scan data connection: record framing and the 16-bit byte-swap
//! state machine.

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, trace};

use crate::proto::{Status, RECORD_TERMINATOR};

/// Reader side of one scan's data connection.
///
/// The stream is a sequence of `u32 length | payload` records; a length
/// of all-ones announces a single status byte and the end of the stream.
/// A socket close without a terminator is an i/o error.
pub(crate) struct DataStream {
    io: OwnedReadHalf,
    /// Payload bytes left in the current record.
    remaining: u64,
    /// Terminal status, re-reported on every call once seen.
    done: Option<Status>,
}

impl DataStream {
    pub(crate) fn new(io: OwnedReadHalf) -> Self {
        DataStream { io, remaining: 0, done: None }
    }

    /// Read the next slice of payload into `buf`. Terminal conditions
    /// come back as `Err`: `Eof` at the end of the frame, `Cancelled`
    /// after a cancellation, `IoError` on anything irregular.
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        if let Some(status) = self.done {
            return Err(status);
        }
        loop {
            if self.remaining == 0 {
                let len = match self.io.read_u32().await {
                    Ok(len) => len,
                    Err(err) => {
                        debug!(error = %err, "data stream closed without terminator");
                        return Err(self.finish(Status::IoError));
                    }
                };
                if len == RECORD_TERMINATOR {
                    let status = match self.io.read_u8().await {
                        Ok(byte) => Status::from_word(byte as i32)
                            .unwrap_or(Status::IoError),
                        Err(_) => Status::IoError,
                    };
                    debug!(%status, "data stream terminator received");
                    let status = if status == Status::Good { Status::IoError } else { status };
                    return Err(self.finish(status));
                }
                trace!(len, "data record");
                self.remaining = len as u64;
                continue;
            }
            let want = (buf.len() as u64).min(self.remaining) as usize;
            if want == 0 {
                return Ok(0);
            }
            let n = match self.io.read(&mut buf[..want]).await {
                Ok(0) => {
                    debug!("data stream closed mid-record");
                    return Err(self.finish(Status::IoError));
                }
                Ok(n) => n,
                Err(err) => {
                    debug!(error = %err, "data stream read failed");
                    return Err(self.finish(Status::IoError));
                }
            };
            self.remaining -= n as u64;
            return Ok(n);
        }
    }

    fn finish(&mut self, status: Status) -> Status {
        self.done = Some(status);
        status
    }
}

/// Residue of the 16-bit byte swap between chunks.
///
/// `hang` holds a wire byte whose partner has not arrived yet; `left` a
/// byte already in the correct order that did not fit the caller's
/// buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SwapState {
    pub hang: Option<u8>,
    pub left: Option<u8>,
}

impl SwapState {
    pub(crate) fn reset(&mut self) {
        *self = SwapState::default();
    }
}

/// Byte-swap a freshly received chunk in place.
///
/// `data[..n]` holds the new wire bytes; the previous hang-over, if any,
/// is spliced in front of them. Returns the number of in-order bytes now
/// in `data`; a byte that pairs up but does not fit becomes the new
/// `left`, a byte without a partner the new `hang`.
pub(crate) fn swap_chunk(state: &mut SwapState, data: &mut [u8], n: usize) -> usize {
    debug_assert!(state.left.is_none());
    if n == 0 {
        return 0;
    }
    match state.hang.take() {
        Some(hang) => {
            let carry = data[n - 1];
            data.copy_within(0..n - 1, 1);
            data[0] = hang;
            if n % 2 == 1 {
                // hang + n bytes pair up completely; the final partner
                // has no slot left.
                state.left = Some(data[n - 1]);
                data[n - 1] = carry;
                swap_pairs(&mut data[..n - 1]);
            } else {
                state.hang = Some(carry);
                swap_pairs(&mut data[..n]);
            }
            n
        }
        None => {
            if n % 2 == 0 {
                swap_pairs(&mut data[..n]);
                n
            } else {
                state.hang = Some(data[n - 1]);
                swap_pairs(&mut data[..n - 1]);
                n - 1
            }
        }
    }
}

fn swap_pairs(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}
