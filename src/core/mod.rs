// Core modules: error model, store client seam, line codec, cancellation, and work queues.
pub mod cancel;
pub mod client;
pub mod codec;
pub mod error;
pub(crate) mod queue;
