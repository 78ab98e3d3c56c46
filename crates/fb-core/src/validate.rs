//! Inbound frame validation.
//!
//! Bounds the serialized payload size, checks subject length and syntax, and
//! rejects frames whose tag requires a subject that is missing.  PING, PONG
//! and AUTH are exempt from subject checks.

use fb_protocol::{error_codes, Frame, FrameType};

use crate::subject;

const MAX_SUBJECT_LEN: usize = 256;

/// A rejected frame, mapped 1:1 to a wire error code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameViolation {
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("subject exceeds {MAX_SUBJECT_LEN} characters")]
    SubjectTooLong,
    #[error("subject is not valid dotted-segment syntax")]
    InvalidSubject,
    #[error("frame type requires a subject")]
    MissingSubject,
}

impl FrameViolation {
    /// The wire error code for the ERROR frame.
    pub fn code(&self) -> &'static str {
        match self {
            FrameViolation::PayloadTooLarge { .. } => error_codes::PAYLOAD_TOO_LARGE,
            FrameViolation::SubjectTooLong | FrameViolation::InvalidSubject => {
                error_codes::INVALID_SUBJECT
            }
            FrameViolation::MissingSubject => error_codes::MALFORMED_FRAME,
        }
    }
}

/// Stateless frame validator.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    pub max_message_size: usize,
}

impl Validator {
    pub fn new(max_message_size: usize) -> Self {
        Validator { max_message_size }
    }

    pub fn validate(&self, frame: &Frame) -> Result<(), FrameViolation> {
        if let Some(payload) = &frame.payload {
            // Size is judged on the serialized payload, matching the wire.
            let size = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0);
            if size > self.max_message_size {
                return Err(FrameViolation::PayloadTooLarge {
                    size,
                    limit: self.max_message_size,
                });
            }
        }

        if frame.frame_type.subject_exempt() {
            return Ok(());
        }

        match &frame.subject {
            None => {
                // Only the subject-bearing kinds hard-require one.
                if matches!(
                    frame.frame_type,
                    FrameType::Publish | FrameType::Subscribe | FrameType::Unsubscribe
                ) {
                    Err(FrameViolation::MissingSubject)
                } else {
                    Ok(())
                }
            }
            Some(s) => {
                if s.len() > MAX_SUBJECT_LEN {
                    return Err(FrameViolation::SubjectTooLong);
                }
                // SUBSCRIBE/UNSUBSCRIBE subjects may be patterns; PUBLISH and
                // the rest must be concrete.
                let ok = match frame.frame_type {
                    FrameType::Subscribe | FrameType::Unsubscribe => subject::valid_pattern(s),
                    _ => subject::valid_subject(s),
                };
                if ok {
                    Ok(())
                } else {
                    Err(FrameViolation::InvalidSubject)
                }
            }
        }
    }
}
