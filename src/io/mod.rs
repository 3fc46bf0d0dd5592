//! I/O utilities
//!
//! - [`sink`]: best-effort writer with a FIFO save queue, the backpressure
//!   primitive shared by the tunnel transport and the TCP flow relay.

pub mod sink;

pub use sink::{QueuedWriter, WriteOutcome};
