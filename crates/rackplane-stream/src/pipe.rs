//! Bounded in-process byte pipes.

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

pub type PipeWriter = WriteHalf<DuplexStream>;
pub type PipeReader = ReadHalf<DuplexStream>;

/// A one-way pipe holding at most `capacity` unread bytes.
///
/// Writers block while the pipe is full. Dropping the writer ends the
/// reader's stream; dropping the reader makes further writes fail.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (near, far) = tokio::io::duplex(capacity);
    let (_, writer) = tokio::io::split(near);
    let (reader, _) = tokio::io::split(far);
    (writer, reader)
}
