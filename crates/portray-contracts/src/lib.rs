pub mod envelope;
pub mod events;
pub mod images;
pub mod request;
pub mod result;

pub use events::{EventLog, EventPayload};
pub use images::ImageData;
pub use request::{Style, SynthesisRequest};
pub use result::{
    Strategy, SynthesisAttempt, SynthesisFailure, SynthesisResult, ValidationReport,
    ValidationResult,
};
