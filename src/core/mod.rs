pub mod audio;
pub mod capture;
pub mod conversation;
pub mod playback;
pub mod session;
pub mod timer;
pub mod tools;
pub mod turn;

// Re-export commonly used types for convenience
pub use session::{
    ActivityMarker, AudioChunk, Content, ContentPart, EncodedFrame, FunctionCall,
    FunctionDeclaration, FunctionResponse, GenerationConfig, LiveError, LiveResult, LiveSession,
    LogDirection, LogEntry, Modality, SessionConfig, SessionEvent, SessionEvents, SessionState,
    TranscriptionSource,
};

pub use turn::{Turn, TurnAccumulator};

pub use capture::{
    AudioCapture, AudioInputDevice, CaptureConfig, CaptureError, CaptureEvent, CaptureEvents,
    CaptureResult, PushInputDevice, PushInputFeeder,
};

pub use playback::{
    AudioSink, PlaybackConfig, PlaybackError, PlaybackEvent, PlaybackEvents, PlaybackHandle,
    PlaybackResult, PlaybackScheduler, VirtualSink,
};

pub use conversation::{Conversation, ConversationError, ConversationEvent, ConversationResult};
pub use tools::{ToolDispatcher, ToolHandler};
