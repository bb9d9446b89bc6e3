//! Response streaming pipeline: LLM chunks in, played audio out.
//!
//! Three stages joined by bounded channels: a splitter that extracts
//! synthesizable units from the accumulating LLM text, a worker pool
//! capped at `max_concurrent_tts` synthesis requests, and a single
//! playback serializer that streams each unit's audio to the sink in
//! submission order. Backpressure falls out of the channel bounds.

pub mod chunker;
mod response;

pub use chunker::UnitChunker;
pub use response::{ResponsePipeline, TurnOutcome, TurnReport};
