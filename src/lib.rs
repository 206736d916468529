//! echoloop - hands-free spoken conversation loop
//!
//! Listens on the microphone until the speaker pauses, transcribes the
//! utterance, asks a chat model for a reply, synthesizes it and plays it
//! back while already listening for the next turn.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 ConversationLoop                      │
//! │   record  →  transcribe  →  respond  →  synthesize    │
//! └────┬───────────────────────────────────────────┬─────┘
//!      │                                           │
//! ┌────▼──────────────────────┐   ┌────────────────▼─────┐
//! │ UtteranceRecorder          │   │ PlaybackController    │
//! │ FrameSource → Gate → WAV   │   │ one session at a time │
//! └───────────────────────────┘   └──────────────────────┘
//! ```

pub mod assets;
pub mod config;
pub mod conversation;
pub mod error;
pub mod responder;
pub mod voice;

pub use assets::{AssetStore, ReplyLog};
pub use config::{Config, Overrides};
pub use conversation::{ConversationLoop, ConversationTurn, StageTimings, TurnOutcome};
pub use error::{Error, Result};
pub use responder::{OpenAiResponder, Responder};
