//! Turn accumulation.
//!
//! The service streams one model turn as many `serverContent` frames. The
//! [`TurnAccumulator`] collects their parts in arrival order and hands out a
//! sealed, immutable [`Turn`] when the service signals completion.
//!
//! Fragments are kept as discrete parts. Adjacent text is never merged, so a
//! transcript can be rebuilt with the provider's exact granularity.

use bytes::{Bytes, BytesMut};

use crate::core::session::ContentPart;

/// One sealed model turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Turn {
    parts: Vec<ContentPart>,
}

impl Turn {
    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Concatenated text of every text part.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(ContentPart::as_text).collect()
    }

    pub fn has_audio(&self) -> bool {
        self.parts.iter().any(ContentPart::is_pcm_audio)
    }

    /// Concatenated PCM bytes of every audio part.
    pub fn audio_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        for part in &self.parts {
            if let ContentPart::InlineAudio { data, .. } = part
                && part.is_pcm_audio()
            {
                out.extend_from_slice(data);
            }
        }
        out.freeze()
    }
}

/// Mutable builder for the turn in progress.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    parts: Vec<ContentPart>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append parts in arrival order.
    pub fn add_parts(&mut self, parts: impl IntoIterator<Item = ContentPart>) {
        self.parts.extend(parts);
    }

    /// Close the turn in progress and start a new empty one.
    pub fn seal(&mut self) -> Turn {
        Turn {
            parts: std::mem::take(&mut self.parts),
        }
    }

    /// Discard the turn in progress.
    pub fn reset(&mut self) {
        self.parts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }
}
