//! Terminal video playback with live captions.
//!
//! The pipeline decodes frames ahead of the display through an external
//! ffmpeg process, renders them to character cells, and presents them with a
//! minimal-update terminal diff. A chunked transcription scheduler keeps a
//! caption track filled ahead of the playhead.

pub mod ascii;
pub mod cancel;
pub mod decoding;
pub mod fingerprint;
pub mod pipeline;
pub mod subtitles;
pub mod term_diff;
pub mod text_frame;
pub mod transcribe;
#[cfg(feature = "whisper")]
pub mod whisper_engine;
