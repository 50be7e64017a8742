//! Typed access to vendor topic segments
//!
//! Vendor topics are slash-delimited paths such as
//! `iot/p2p/<cmd>/<fromId>/<fromType>/<fromRes>/<toId>/<toType>/<toRes>/<q|p>/<reqId>/<fmt>`.
//! Segment 3 names the sender, segment 6 the receiver and segment 10 carries
//! the request correlation id on p2p topics.

use std::fmt;

use super::error::TopicError;

pub const MIN_SEGMENTS: usize = 7;

pub const SENDER_SEGMENT: usize = 3;
pub const RECEIVER_SEGMENT: usize = 6;
pub const CORRELATION_SEGMENT: usize = 10;

/// Marker used by the helper bot in sender/receiver segments.
pub const HELPER_BOT_MARKER: &str = "helperbot";
/// Marker substituted for the real requester while a vendor request is in flight.
pub const PROXY_HELPER_MARKER: &str = "proxyhelper";

/// Diagnostic classification of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    CommandResponse,
    Command,
    Broadcast,
    Generic,
}

impl MessageRole {
    pub fn label(&self) -> &'static str {
        match self {
            MessageRole::CommandResponse => "Received Response",
            MessageRole::Command => "Send Command",
            MessageRole::Broadcast => "Received Broadcast",
            MessageRole::Generic => "Received Message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    segments: Vec<String>,
}

impl ParsedTopic {
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let segments: Vec<String> = topic.split('/').map(str::to_string).collect();
        if segments.len() < MIN_SEGMENTS {
            return Err(TopicError::TooShort {
                topic: topic.to_string(),
                segments: segments.len(),
                required: MIN_SEGMENTS,
            });
        }
        Ok(Self { segments })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn channel(&self) -> &str {
        &self.segments[1]
    }

    pub fn sender(&self) -> &str {
        &self.segments[SENDER_SEGMENT]
    }

    pub fn receiver(&self) -> &str {
        &self.segments[RECEIVER_SEGMENT]
    }

    pub fn correlation_id(&self) -> Result<&str, TopicError> {
        self.segment(CORRELATION_SEGMENT)
            .ok_or_else(|| TopicError::MissingSegment {
                topic: self.to_string(),
                index: CORRELATION_SEGMENT,
            })
    }

    pub fn is_p2p(&self) -> bool {
        self.channel() == "p2p" && self.len() > CORRELATION_SEGMENT
    }

    pub fn role(&self) -> MessageRole {
        if self.receiver() == HELPER_BOT_MARKER {
            MessageRole::CommandResponse
        } else if self.sender() == HELPER_BOT_MARKER {
            MessageRole::Command
        } else if self.channel() == "atr" {
            MessageRole::Broadcast
        } else {
            MessageRole::Generic
        }
    }

    /// Returns a copy with one segment replaced.
    pub fn with_segment(&self, index: usize, value: &str) -> Result<Self, TopicError> {
        if index >= self.segments.len() {
            return Err(TopicError::MissingSegment {
                topic: self.to_string(),
                index,
            });
        }
        let mut segments = self.segments.clone();
        segments[index] = value.to_string();
        Ok(Self { segments })
    }
}

impl fmt::Display for ParsedTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}
