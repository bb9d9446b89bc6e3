//! Pipeline orchestration for one assistant turn.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ErrorStrategy, InterruptionStrategy, PipelineConfig};
use crate::error::Result;
use crate::ingress::{AudioSink, EventSink, SessionEvent};
use crate::llm::TokenStream;
use crate::metrics::Metrics;
use crate::tts::{TtsClient, VoiceConfig};

/// Per-unit audio channel depth; chunks are large (tens of KB).
const UNIT_AUDIO_CHANNEL_SIZE: usize = 8;

/// How the turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Every extracted unit was handed to the serializer and playback
    /// drained.
    Completed,
    /// The user interrupted; playback stopped per the configured policy.
    Interrupted,
    /// The session was cancelled (disconnect) mid-turn.
    Cancelled,
    /// The LLM stream failed after its first chunk; the reply is
    /// audibly truncated and the caller speaks an apology.
    LlmAborted(String),
}

/// What happened during one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    /// Concatenated LLM text, including text never synthesized.
    pub full_text: String,
    pub outcome: TurnOutcome,
    /// Units handed to the serializer.
    pub units_total: usize,
    /// Units whose audio played to the end.
    pub units_played: usize,
    /// Units dropped by the error policy.
    pub units_skipped: usize,
    /// Time from pipeline start to the first LLM chunk.
    pub llm_first_chunk_ms: Option<u64>,
    /// Approximate duration of the audio handed to the sink.
    pub assistant_audio_ms: Option<u64>,
}

/// Turns an LLM chunk sequence into ordered, progressively played audio.
pub struct ResponsePipeline {
    tts: TtsClient,
    config: PipelineConfig,
    metrics: Arc<Metrics>,
}

impl ResponsePipeline {
    pub fn new(tts: TtsClient, config: PipelineConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            tts,
            config,
            metrics,
        }
    }

    /// Run one turn to completion.
    ///
    /// `interrupt` flips to `true` when the user starts speaking again;
    /// the configured interruption policy decides what that means.
    /// `cancel` is the session token: disconnect stops everything.
    pub async fn run(
        &self,
        mut chunks: TokenStream,
        voice: VoiceConfig,
        sink: Arc<dyn AudioSink>,
        events: Arc<dyn EventSink>,
        mut interrupt: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> TurnReport {
        let started = Instant::now();
        let policy = self.config.interruption_strategy;
        let workers_cancel = cancel.child_token();

        let (job_tx, job_rx) = mpsc::channel::<UnitJob>(self.config.max_concurrent_tts);
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tts));

        let serializer = tokio::spawn(serialize_playback(PlaybackParams {
            job_rx,
            sink,
            events: Arc::clone(&events),
            metrics: Arc::clone(&self.metrics),
            prebuffer_bytes: self.tts.prebuffer_bytes(),
            policy,
            interrupt: interrupt.clone(),
            workers_cancel: workers_cancel.clone(),
            cancel: cancel.clone(),
        }));

        // Splitter: accumulate chunks, extract units, enqueue jobs. The
        // bounded job channel caps how far extraction runs ahead.
        let mut chunker = super::UnitChunker::new(&self.config);
        let mut full_text = String::new();
        let mut units_total = 0usize;
        let mut first_chunk_ms = None;
        let mut outcome = TurnOutcome::Completed;
        let mut interrupt_open = true;

        'stream: loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    outcome = TurnOutcome::Cancelled;
                    break 'stream;
                }
                changed = interrupt.changed(),
                    if interrupt_open && policy != InterruptionStrategy::Drain =>
                {
                    match changed {
                        Ok(()) if *interrupt.borrow() => {
                            outcome = TurnOutcome::Interrupted;
                            break 'stream;
                        }
                        Ok(()) => {}
                        Err(_) => interrupt_open = false,
                    }
                    continue;
                }
                next = chunks.next_chunk() => next,
            };
            match next {
                Some(Ok(text)) => {
                    if first_chunk_ms.is_none() {
                        first_chunk_ms = Some(started.elapsed().as_millis() as u64);
                    }
                    let _ = events
                        .emit(SessionEvent::AiResponseChunk { text: text.clone() })
                        .await;
                    full_text.push_str(&text);
                    for unit in chunker.push(&text) {
                        if !self
                            .enqueue_unit(&job_tx, &permits, &workers_cancel, unit, &voice, &mut units_total)
                            .await
                        {
                            break 'stream;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "LLM stream failed mid-turn, truncating reply");
                    outcome = TurnOutcome::LlmAborted(e.to_string());
                    break 'stream;
                }
                None => break 'stream,
            }
        }

        if cancel.is_cancelled() && !matches!(outcome, TurnOutcome::LlmAborted(_)) {
            outcome = TurnOutcome::Cancelled;
        }

        // The trailing fragment is a real unit; short replies may be
        // nothing but it.
        if outcome == TurnOutcome::Completed
            && let Some(tail) = chunker.flush()
        {
            let _ = self
                .enqueue_unit(&job_tx, &permits, &workers_cancel, tail, &voice, &mut units_total)
                .await;
        }

        drop(job_tx);
        let playback = match serializer.await {
            Ok(p) => p,
            Err(e) => {
                warn!("playback serializer panicked: {e}");
                PlaybackSummary::default()
            }
        };

        if playback.interrupted && outcome == TurnOutcome::Completed {
            outcome = TurnOutcome::Interrupted;
        }
        if outcome == TurnOutcome::Completed {
            let _ = events.emit(SessionEvent::AiResponseComplete).await;
        }

        TurnReport {
            full_text,
            outcome,
            units_total,
            units_played: playback.units_played,
            units_skipped: playback.units_skipped,
            llm_first_chunk_ms: first_chunk_ms,
            assistant_audio_ms: playback.audio_ms(),
        }
    }

    /// Spawn a synthesis worker for one unit and queue it for playback.
    /// Returns `false` when the serializer is gone (turn is over).
    async fn enqueue_unit(
        &self,
        job_tx: &mpsc::Sender<UnitJob>,
        permits: &Arc<Semaphore>,
        workers_cancel: &CancellationToken,
        text: String,
        voice: &VoiceConfig,
        units_total: &mut usize,
    ) -> bool {
        let index = *units_total;
        *units_total += 1;

        let (audio_tx, audio_rx) = mpsc::channel::<Result<Bytes>>(UNIT_AUDIO_CHANNEL_SIZE);
        let job = UnitJob { index, audio_rx };

        let tts = self.tts.clone();
        let voice = voice.clone();
        let strategy = self.config.error_strategy;
        let permits = Arc::clone(permits);
        let cancel = workers_cancel.clone();
        tokio::spawn(async move {
            synthesize_unit(tts, text, voice, strategy, permits, cancel, audio_tx).await;
        });

        job_tx.send(job).await.is_ok()
    }
}

/// One queued unit awaiting playback, in submission order.
struct UnitJob {
    index: usize,
    audio_rx: mpsc::Receiver<Result<Bytes>>,
}

/// Synthesis worker: one unit, one permit, one audio channel.
async fn synthesize_unit(
    tts: TtsClient,
    text: String,
    voice: VoiceConfig,
    strategy: ErrorStrategy,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    audio_tx: mpsc::Sender<Result<Bytes>>,
) {
    let _permit = match permits.acquire_owned().await {
        Ok(p) => p,
        Err(_) => return,
    };
    if cancel.is_cancelled() {
        return;
    }

    let stream = match strategy {
        ErrorStrategy::Skip => tts.synthesize(&text, &voice).await,
        ErrorStrategy::Retry => tts.synthesize_with_retry(&text, &voice, tts.max_attempts()).await,
        ErrorStrategy::Fallback => match tts.synthesize(&text, &voice).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!(error = %e, "TTS failed, trying degraded path");
                tts.synthesize_degraded(&text).await
            }
        },
    };

    let mut stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = audio_tx.send(Err(e)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            chunk = stream.next_chunk() => match chunk {
                Some(Ok(bytes)) => {
                    if audio_tx.send(Ok(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = audio_tx.send(Err(e)).await;
                    break;
                }
                None => break,
            },
        }
    }
}

struct PlaybackParams {
    job_rx: mpsc::Receiver<UnitJob>,
    sink: Arc<dyn AudioSink>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    prebuffer_bytes: usize,
    policy: InterruptionStrategy,
    interrupt: watch::Receiver<bool>,
    workers_cancel: CancellationToken,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct PlaybackSummary {
    units_played: usize,
    units_skipped: usize,
    audio_bytes: u64,
    byte_rate: Option<u32>,
    interrupted: bool,
}

impl PlaybackSummary {
    fn audio_ms(&self) -> Option<u64> {
        let rate = self.byte_rate?;
        if rate == 0 {
            return None;
        }
        // Each played unit carries one RIFF header.
        let headers = self.units_played as u64 * 44;
        Some(self.audio_bytes.saturating_sub(headers) * 1_000 / u64::from(rate))
    }
}

/// Single consumer that plays unit audio strictly in submission order,
/// regardless of synthesis parallelism.
async fn serialize_playback(mut params: PlaybackParams) -> PlaybackSummary {
    let mut summary = PlaybackSummary::default();
    let mut speaking = false;
    let mut interrupt_open = true;

    'units: loop {
        // Graceful stops between units; immediate stops anywhere.
        if params.policy != InterruptionStrategy::Drain && *params.interrupt.borrow() {
            summary.interrupted = true;
            break;
        }
        let job = tokio::select! {
            () = params.cancel.cancelled() => break,
            job = params.job_rx.recv() => match job {
                Some(j) => j,
                None => break,
            },
        };
        let mut audio_rx = job.audio_rx;

        // Prebuffer: batch the first chunks so playback never starts and
        // immediately starves.
        let mut pre: Vec<u8> = Vec::new();
        let mut unit_failed = false;
        let mut drained = false;
        while pre.len() < params.prebuffer_bytes {
            let chunk = tokio::select! {
                () = params.cancel.cancelled() => break 'units,
                changed = params.interrupt.changed(),
                    if interrupt_open && params.policy == InterruptionStrategy::Immediate =>
                {
                    match changed {
                        Ok(()) if *params.interrupt.borrow() => {
                            summary.interrupted = true;
                            params.workers_cancel.cancel();
                            break 'units;
                        }
                        Ok(()) => {}
                        Err(_) => interrupt_open = false,
                    }
                    continue;
                }
                chunk = audio_rx.recv() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => pre.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    debug!(unit = job.index, error = %e, "unit synthesis failed, skipping");
                    unit_failed = true;
                    break;
                }
                None => {
                    drained = true;
                    break;
                }
            }
        }
        if unit_failed || (drained && pre.is_empty()) {
            params.metrics.tts_unit_skipped();
            summary.units_skipped += 1;
            continue;
        }

        if !speaking {
            speaking = true;
            let _ = params.events.emit(SessionEvent::TtsStart).await;
            let _ = params
                .events
                .emit(SessionEvent::BotSpeakingStateChanged { speaking: true })
                .await;
        }
        if summary.byte_rate.is_none() {
            summary.byte_rate = wav_byte_rate(&pre);
        }

        summary.audio_bytes += pre.len() as u64;
        if params.sink.play(Bytes::from(pre)).await.is_err() {
            // The transport is gone; the session is about to be detached.
            break;
        }

        // Stream the remainder of the unit at sink speed.
        let mut failed_mid_unit = false;
        if !drained {
            loop {
                let chunk = tokio::select! {
                    () = params.cancel.cancelled() => break 'units,
                    changed = params.interrupt.changed(),
                        if params.policy == InterruptionStrategy::Immediate =>
                    {
                        if changed.is_ok() && *params.interrupt.borrow() {
                            summary.interrupted = true;
                            params.workers_cancel.cancel();
                            break 'units;
                        }
                        continue;
                    }
                    chunk = audio_rx.recv() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        summary.audio_bytes += bytes.len() as u64;
                        if params.sink.play(bytes).await.is_err() {
                            break 'units;
                        }
                    }
                    Some(Err(e)) => {
                        // Audio already played cannot be unplayed; the
                        // rest of this unit is dropped.
                        debug!(unit = job.index, error = %e, "unit failed mid-stream");
                        params.metrics.tts_unit_skipped();
                        failed_mid_unit = true;
                        break;
                    }
                    None => break,
                }
            }
        }

        if failed_mid_unit {
            summary.units_skipped += 1;
        } else {
            summary.units_played += 1;
        }
    }

    if speaking {
        let _ = params
            .events
            .emit(SessionEvent::BotSpeakingStateChanged { speaking: false })
            .await;
        let _ = params.events.emit(SessionEvent::TtsComplete).await;
    }
    summary
}

/// Derive bytes-per-second from a WAV header prefix, for duration
/// metering. `None` for non-WAV formats.
fn wav_byte_rate(prefix: &[u8]) -> Option<u32> {
    let reader = hound::WavReader::new(Cursor::new(prefix)).ok()?;
    let spec = reader.spec();
    Some(
        spec.sample_rate * u32::from(spec.channels) * u32::from(spec.bits_per_sample / 8),
    )
}
