//! rackplane-stream: bidirectional byte relays.
//!
//! Exec and attach sessions splice a caller's stream onto a container's
//! stdin/stdout pair and finish with an exit-code trailer line. Proxy
//! sessions splice a caller's stream onto a TCP connection.

pub mod error;
pub mod pipe;
pub mod proxy;
pub mod relay;
pub mod trailer;

pub use error::{StreamError, StreamResult};
pub use pipe::{DEFAULT_PIPE_CAPACITY, PipeReader, PipeWriter, pipe};
pub use proxy::{CONNECT_TIMEOUT, proxy};
pub use relay::relay;
pub use trailer::{STATUS_CODE_PREFIX, parse_trailer, trailer};
