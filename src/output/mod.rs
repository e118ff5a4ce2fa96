//! Output: progress bars, JSON envelopes, CSV exports and text rendering.

pub mod csv;
pub mod json_envelope;
pub mod progress;
pub mod text;

pub use json_envelope::{
    ErrorPayload, EventType, ResultType, RunCompletedPayload, RunStartedPayload, emit_json,
    emit_json_result,
};
