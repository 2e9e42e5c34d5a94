//! Message transport: framing, the worker-side multiplexer, and the TCP
//! bridge that exposes the channels to external processes.

pub mod framing;
pub mod mux;
pub mod tcp;

pub use framing::{Envelope, Frame, Multipart};
pub use mux::{MuxEndpoints, PollStatus, RequestEndpoint, Sink, TransportMux};
