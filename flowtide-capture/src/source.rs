//! The capture source abstraction.

use std::collections::VecDeque;

use crate::error::CaptureError;
use crate::frame::{Frame, LinkType};

/// A pull-based stream of captured frames.
///
/// Sources are read from a blocking thread, so implementations may block
/// in `next_frame`. `Ok(None)` marks the end of the capture; an error is
/// fatal for the session reading it.
pub trait PacketSource: Send {
    /// Stable identifier of the capture contents.
    fn capture_id(&self) -> &str;

    fn link_type(&self) -> LinkType;

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn capture_id(&self) -> &str {
        (**self).capture_id()
    }

    fn link_type(&self) -> LinkType {
        (**self).link_type()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }
}

/// Frames held in memory, used for replays and tests.
#[derive(Debug)]
pub struct MemorySource {
    capture_id: String,
    link_type: LinkType,
    frames: VecDeque<Frame>,
    served: u64,
    fail_after: Option<(u64, String)>,
}

impl MemorySource {
    pub fn new(capture_id: impl Into<String>, link_type: LinkType) -> Self {
        Self {
            capture_id: capture_id.into(),
            link_type,
            frames: VecDeque::new(),
            served: 0,
            fail_after: None,
        }
    }

    /// Appends a frame, numbering it after the frames already queued.
    pub fn push(&mut self, timestamp_ns: u64, data: impl Into<bytes::Bytes>) -> &mut Self {
        let index = self.served + self.frames.len() as u64;
        self.frames
            .push_back(Frame::new(index, timestamp_ns, self.link_type, data));
        self
    }

    pub fn with_frames<I, D>(mut self, frames: I) -> Self
    where
        I: IntoIterator<Item = (u64, D)>,
        D: Into<bytes::Bytes>,
    {
        for (timestamp_ns, data) in frames {
            self.push(timestamp_ns, data);
        }
        self
    }

    /// Reports a framing error once `frames` frames have been served.
    pub fn fail_after(mut self, frames: u64, message: impl Into<String>) -> Self {
        self.fail_after = Some((frames, message.into()));
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl PacketSource for MemorySource {
    fn capture_id(&self) -> &str {
        &self.capture_id
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some((limit, message)) = &self.fail_after {
            if self.served >= *limit {
                return Err(CaptureError::Framing {
                    frame: self.served,
                    message: message.clone(),
                });
            }
        }
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.served += 1;
        }
        Ok(frame)
    }
}
