//! Streaming wire format: frame decoding and translation into workflow events.

pub mod frame;
pub mod translator;

pub use frame::{Frame, FrameDecoder, FrameTag, MAX_LINE_BYTES};
pub use translator::{is_fatal_error, EventTranslator, WorkflowEvent};
