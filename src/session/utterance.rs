//! The per-session speaking-turn state machine.
//!
//! `Idle → Listening → Finalizing → Responding → Idle`. One utterance at
//! a time: the speaking lock is the `speaker` binding of the active turn,
//! and a second speaker arriving mid-turn is ignored (a metric
//! increments), never queued. Silence is re-evaluated on every inbound
//! frame — including frames that decode to nothing — and a deadline timer
//! covers the case where the transport goes quiet entirely.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{AudioDecoder, ContainerOpusDecoder, DecodeOutcome, FramedOpusDecoder};
use crate::error::Result;
use crate::ingress::{IngressEvent, SessionEvent};
use crate::llm::{ChatMessage, GenerateRequest, TokenStream};
use crate::pipeline::{ResponsePipeline, TurnOutcome};
use crate::store::types::{IngressKind, Role, TurnLatency};
use crate::stt::{AudioFormat, SttEvent, SttStream};
use crate::tts::VoiceConfig;

use super::SessionContext;

/// An utterance shorter than this on STT disconnect is treated as
/// "near silence": reconnect, replay, and finalize immediately.
const SHORT_UTTERANCE: Duration = Duration::from_secs(2);

/// Spoken line for failures in the hearing path.
const APOLOGY_STT: &str = "I had trouble hearing you. Could you say that again?";
/// Spoken line for failures in the thinking/speaking path.
const APOLOGY_LLM: &str = "I can't reach my voice right now. Please try again in a moment.";

/// Why a listening phase ended.
enum ListenEnd {
    /// Silence threshold, max duration, or speaker-end hint.
    Finalize,
    /// The engine produced its terminal final on its own.
    EngineFinal(String),
    /// Ingress disconnected or the session was cancelled.
    Disconnect,
    /// The STT path failed terminally; the error was already surfaced.
    SttFailed,
}

/// Runs the speaking-turn state machine for one session.
pub struct UtteranceMachine {
    ctx: SessionContext,
    decoder: Box<dyn AudioDecoder>,
}

impl UtteranceMachine {
    pub fn new(ctx: SessionContext) -> Result<Self> {
        let decoder: Box<dyn AudioDecoder> = match ctx.session.ingress {
            IngressKind::Chat => Box::new(FramedOpusDecoder::new()?),
            IngressKind::Browser => Box::new(ContainerOpusDecoder::new()?),
        };
        Ok(Self { ctx, decoder })
    }

    /// Session main loop. Returns when the ingress disconnects, the idle
    /// timeout fires, or the session is cancelled.
    pub async fn run(mut self, mut events: mpsc::Receiver<IngressEvent>, cancel: CancellationToken) {
        let idle_timeout =
            Duration::from_millis(self.ctx.config.get().ingress.idle_timeout_ms.max(1));
        loop {
            let idle_deadline = Instant::now() + idle_timeout;
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(idle_deadline) => {
                    info!(session = %self.ctx.session.id, "session idle timeout");
                    break;
                }
                event = events.recv() => match event {
                    Some(ev) => ev,
                    None => break,
                },
            };

            let turn_start = match event {
                IngressEvent::SpeakerStart { user_id } => Some((user_id, None)),
                // The browser connection carries no per-turn speaker
                // events; the first audio frame of a new turn starts it.
                IngressEvent::Audio { user_id, frame }
                    if self.ctx.session.ingress == IngressKind::Browser =>
                {
                    Some((user_id, Some(frame)))
                }
                IngressEvent::Audio { .. } | IngressEvent::SpeakerEnd { .. } => None,
                IngressEvent::Disconnect => break,
            };

            if let Some((speaker, first_frame)) = turn_start {
                if speaker != self.ctx.session.user_id {
                    // Not the session owner; ignored by design.
                    self.ctx.metrics.second_speaker_ignored();
                    debug!(session = %self.ctx.session.id, speaker = %speaker, "ignoring non-owner speaker");
                    continue;
                }
                let disconnected = self
                    .run_turn(speaker, first_frame, &mut events, &cancel)
                    .await;
                if disconnected {
                    break;
                }
            }
        }
        debug!(session = %self.ctx.session.id, "session loop ended");
    }

    /// One full turn: Listening → Finalizing → Responding. Returns `true`
    /// when the ingress disconnected and the session loop should end.
    async fn run_turn(
        &mut self,
        speaker: String,
        first_frame: Option<Bytes>,
        events: &mut mpsc::Receiver<IngressEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let config = self.ctx.config.get();
        let turn_started = Instant::now();

        // -- Listening --
        self.decoder.begin_utterance();
        let format = match self.ctx.session.ingress {
            IngressKind::Chat => AudioFormat::OpusFrames,
            IngressKind::Browser => AudioFormat::Pcm16k,
        };
        let mut stt = match self.ctx.open_stt(&speaker, format, config.turn.silence_threshold()).await {
            Some(stream) => stream,
            None => {
                self.ctx.emit(SessionEvent::ServiceError {
                    message: "speech recognition unavailable".into(),
                })
                .await;
                self.ctx.speak_apology(APOLOGY_STT).await;
                return false;
            }
        };

        let mut partial = String::new();
        let mut user_audio_ms = 0u64;
        if let Some(frame) = first_frame {
            self.ingest_frame(&mut stt, frame, &mut user_audio_ms).await;
        }

        let end = self
            .listen(&mut stt, &speaker, &mut partial, &mut user_audio_ms, events, cancel, &config)
            .await;

        let final_text = match end {
            ListenEnd::Disconnect => {
                stt.close().await;
                return true;
            }
            ListenEnd::SttFailed => {
                stt.close().await;
                self.ctx.emit(SessionEvent::ServiceError {
                    message: "speech recognition failed".into(),
                })
                .await;
                self.ctx.speak_apology(APOLOGY_STT).await;
                return false;
            }
            ListenEnd::EngineFinal(text) => {
                stt.close().await;
                self.ctx.emit(SessionEvent::StopListening).await;
                text
            }
            ListenEnd::Finalize => {
                // -- Finalizing --
                self.ctx.emit(SessionEvent::StopListening).await;
                let text = finalize_transcript(
                    &mut stt,
                    partial,
                    Duration::from_millis(config.stt.finalize_timeout_ms),
                )
                .await;
                stt.close().await;
                text
            }
        };

        // Empty or non-speech transcripts end the turn silently.
        if is_blank_transcript(&final_text) {
            debug!(session = %self.ctx.session.id, "blank transcript, short-circuiting turn");
            return false;
        }
        let final_text = final_text.trim().to_owned();
        self.ctx.emit(SessionEvent::FinalTranscript {
            text: final_text.clone(),
        })
        .await;

        // -- Responding --
        self.respond(&final_text, user_audio_ms, turn_started, events, cancel)
            .await
    }

    /// Listening loop: feed audio in order, track silence and the
    /// max-duration deadline, surface partials.
    #[allow(clippy::too_many_arguments)]
    async fn listen(
        &mut self,
        stt: &mut SttStream,
        speaker: &str,
        partial: &mut String,
        user_audio_ms: &mut u64,
        events: &mut mpsc::Receiver<IngressEvent>,
        cancel: &CancellationToken,
        config: &crate::config::GatewayConfig,
    ) -> ListenEnd {
        let silence = config.turn.silence_threshold();
        let started = Instant::now();
        let max_deadline = started + config.turn.max_utterance();
        let mut last_audio = Instant::now();

        loop {
            let deadline = (last_audio + silence).min(max_deadline);
            tokio::select! {
                () = cancel.cancelled() => return ListenEnd::Disconnect,
                () = tokio::time::sleep_until(deadline) => return ListenEnd::Finalize,
                event = events.recv() => match event {
                    Some(IngressEvent::Audio { user_id, frame }) if user_id == speaker => {
                        // Every inbound frame counts as audio for silence
                        // purposes, even ones that decode to nothing.
                        last_audio = Instant::now();
                        if !self.ingest_frame(stt, frame, user_audio_ms).await {
                            // Send path broken: decide replay by utterance age.
                            let long = started.elapsed() >= SHORT_UTTERANCE;
                            self.ctx.metrics.stt_reconnect();
                            match stt.reconnect(true).await {
                                Ok(()) if long => {}
                                Ok(()) => return ListenEnd::Finalize,
                                Err(e) => {
                                    warn!(error = %e, "STT reconnect failed");
                                    return ListenEnd::SttFailed;
                                }
                            }
                        }
                    }
                    Some(IngressEvent::Audio { .. }) => {
                        // Frames from a non-owner speaker are dropped.
                    }
                    Some(IngressEvent::SpeakerStart { user_id }) => {
                        if user_id != speaker {
                            self.ctx.metrics.second_speaker_ignored();
                        }
                    }
                    Some(IngressEvent::SpeakerEnd { user_id }) if user_id == speaker => {
                        // Transport hint: stop waiting out the silence
                        // threshold and finalize now.
                        return ListenEnd::Finalize;
                    }
                    Some(IngressEvent::SpeakerEnd { .. }) => {}
                    Some(IngressEvent::Disconnect) | None => return ListenEnd::Disconnect,
                },
                stt_event = stt.next_event() => match stt_event {
                    SttEvent::Partial(text) => {
                        *partial = text.clone();
                        self.ctx.emit(SessionEvent::PartialTranscript { text }).await;
                    }
                    SttEvent::Final(text) => return ListenEnd::EngineFinal(text),
                    SttEvent::Ready => {}
                    SttEvent::EngineError(e) => {
                        warn!(session = %self.ctx.session.id, "STT engine error: {e}");
                    }
                    SttEvent::Disconnected(reason) => {
                        debug!(session = %self.ctx.session.id, reason = %reason, "STT stream dropped");
                        let long = started.elapsed() >= SHORT_UTTERANCE;
                        self.ctx.metrics.stt_reconnect();
                        match stt.reconnect(true).await {
                            Ok(()) if long => {}
                            Ok(()) => return ListenEnd::Finalize,
                            Err(e) => {
                                warn!(error = %e, "STT reconnect failed");
                                return ListenEnd::SttFailed;
                            }
                        }
                    }
                },
            }
        }
    }

    /// Decode one frame and forward audio to the engine in arrival order.
    /// Returns `false` when the STT send path is broken.
    async fn ingest_frame(
        &mut self,
        stt: &mut SttStream,
        frame: Bytes,
        user_audio_ms: &mut u64,
    ) -> bool {
        let outcome = self.decoder.decode(&frame);
        let pcm_frames = match outcome {
            DecodeOutcome::Decoded(frames) => frames,
            DecodeOutcome::NeedMoreData => Vec::new(),
            DecodeOutcome::InvalidData => {
                debug!(session = %self.ctx.session.id, "dropping undecodable audio bytes");
                Vec::new()
            }
        };
        for f in &pcm_frames {
            *user_audio_ms += f.duration_ms();
        }

        match self.ctx.session.ingress {
            // The engine decodes Opus itself; frames pass through untouched.
            IngressKind::Chat => stt.send_audio(frame).await.is_ok(),
            // The engine receives the server-side PCM decode.
            IngressKind::Browser => {
                for f in pcm_frames {
                    if stt.send_audio(Bytes::from(f.to_le_bytes())).await.is_err() {
                        return false;
                    }
                }
                true
            }
        }
    }


    /// Responding state: persist the user message, stream the LLM through
    /// the response pipeline, persist the assistant message. Returns
    /// `true` on ingress disconnect.
    async fn respond(
        &mut self,
        user_text: &str,
        user_audio_ms: u64,
        turn_started: Instant,
        events: &mut mpsc::Receiver<IngressEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let config = self.ctx.config.get();
        let session_id = self.ctx.session.id;

        // User message lands before the assistant's, always.
        let user_latency = TurnLatency {
            user_audio_ms: Some(user_audio_ms),
            ..TurnLatency::default()
        };
        if let Err(e) = self
            .ctx
            .store
            .append_message(session_id, Role::User, user_text, Some(user_latency))
            .await
        {
            warn!(session = %session_id, error = %e, "failed to persist user message");
        }

        let request = match self.ctx.build_request(&config).await {
            Ok(r) => r,
            Err(e) => {
                warn!(session = %session_id, error = %e, "failed to build prompt");
                self.ctx.speak_apology(APOLOGY_LLM).await;
                return false;
            }
        };

        let stream = match self.ctx.provider.generate_stream(&request).await {
            Ok(s) => s,
            Err(e) => {
                warn!(session = %session_id, error = %e, "LLM unavailable");
                self.ctx.emit(SessionEvent::ServiceError {
                    message: "assistant unavailable".into(),
                })
                .await;
                self.ctx.speak_apology(APOLOGY_LLM).await;
                return false;
            }
        };
        let voice = self.voice_for_turn(&stream);

        let pipeline = ResponsePipeline::new(
            self.ctx.tts.clone(),
            config.pipeline.clone(),
            std::sync::Arc::clone(&self.ctx.metrics),
        );
        let turn_cancel = cancel.child_token();
        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        let run = pipeline.run(
            stream,
            voice,
            std::sync::Arc::clone(&self.ctx.sink),
            std::sync::Arc::clone(&self.ctx.events),
            interrupt_rx,
            turn_cancel.clone(),
        );
        tokio::pin!(run);

        // While responding, watch the ingress: same-speaker speech is an
        // interruption; frames themselves are dropped (audio is a no-op
        // outside Listening).
        let mut disconnected = false;
        let report = loop {
            tokio::select! {
                report = &mut run => break report,
                () = cancel.cancelled(), if !disconnected => {
                    turn_cancel.cancel();
                    disconnected = true;
                }
                event = events.recv(), if !disconnected => match event {
                    Some(IngressEvent::Audio { user_id, .. } | IngressEvent::SpeakerStart { user_id }) => {
                        if user_id == self.ctx.session.user_id {
                            let _ = interrupt_tx.send(true);
                        } else {
                            self.ctx.metrics.second_speaker_ignored();
                        }
                    }
                    Some(IngressEvent::SpeakerEnd { .. }) => {}
                    Some(IngressEvent::Disconnect) | None => {
                        turn_cancel.cancel();
                        disconnected = true;
                    }
                },
            }
        };

        if !report.full_text.trim().is_empty() {
            let latency = TurnLatency {
                user_audio_ms: Some(user_audio_ms),
                assistant_audio_ms: report.assistant_audio_ms,
                llm_first_chunk_ms: report.llm_first_chunk_ms,
                total_turn_ms: Some(turn_started.elapsed().as_millis() as u64),
            };
            if let Err(e) = self
                .ctx
                .store
                .append_message(session_id, Role::Assistant, &report.full_text, Some(latency))
                .await
            {
                warn!(session = %session_id, error = %e, "failed to persist assistant message");
            }
        }

        match &report.outcome {
            TurnOutcome::Completed => {
                self.ctx.metrics.turn_completed();
                info!(
                    session = %session_id,
                    units = report.units_total,
                    skipped = report.units_skipped,
                    "turn completed"
                );
            }
            TurnOutcome::Interrupted => {
                debug!(session = %session_id, "turn interrupted by user");
            }
            TurnOutcome::Cancelled => {}
            TurnOutcome::LlmAborted(reason) => {
                warn!(session = %session_id, reason = %reason, "turn aborted mid-generation");
                self.ctx.emit(SessionEvent::ServiceError {
                    message: "assistant response was cut short".into(),
                })
                .await;
                self.ctx.speak_apology(APOLOGY_LLM).await;
            }
        }
        disconnected
    }

    /// Agent voice, with any per-request webhook overrides applied.
    fn voice_for_turn(&self, stream: &TokenStream) -> VoiceConfig {
        let params = &self.ctx.agent.tts_params;
        let mut voice = VoiceConfig {
            voice: self.ctx.agent.tts_voice.clone(),
            exaggeration: params.exaggeration,
            cfg_weight: params.cfg_weight,
            temperature: params.temperature,
            speed: 1.0,
        };
        if let Some(overrides) = &stream.tts_overrides {
            if let Some(v) = &overrides.voice {
                voice.voice = v.clone();
            }
            if let Some(e) = overrides.exaggeration {
                voice.exaggeration = e;
            }
            if let Some(w) = overrides.cfg_weight {
                voice.cfg_weight = w;
            }
            if let Some(t) = overrides.temperature {
                voice.temperature = t;
            }
        }
        voice
    }

}

impl SessionContext {
    /// Open the STT stream, allowing one quick retry inside the silence
    /// budget before declaring the turn lost.
    async fn open_stt(&self, speaker: &str, format: AudioFormat, silence: Duration) -> Option<SttStream> {
        match self.stt.open(speaker, format).await {
            Ok(stream) => Some(stream),
            Err(first) => {
                debug!(error = %first, "STT open failed, retrying once");
                self.metrics.stt_reconnect();
                tokio::time::sleep(silence.min(Duration::from_millis(250))).await;
                match self.stt.open(speaker, format).await {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        warn!(session = %self.session.id, error = %e, "STT unavailable");
                        None
                    }
                }
            }
        }
    }

    /// Speak a short template line through the normal synthesis path.
    /// Best-effort: a failure here is logged and dropped.
    async fn speak_apology(&self, line: &str) {
        let voice = VoiceConfig {
            voice: self.agent.tts_voice.clone(),
            ..VoiceConfig::default()
        };
        match self.tts.synthesize(line, &voice).await {
            Ok(stream) => match stream.collect().await {
                Ok(audio) if !audio.is_empty() => {
                    let _ = self.sink.play(Bytes::from(audio)).await;
                }
                Ok(_) => {}
                Err(e) => debug!("apology synthesis stream failed: {e}"),
            },
            Err(e) => debug!("apology synthesis failed: {e}"),
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.emit(event).await;
    }

    /// System prompt plus the cached recent history. The just-persisted
    /// user message is part of the context read.
    async fn build_request(&self, config: &crate::config::GatewayConfig) -> Result<GenerateRequest> {
        let context = self.store.get_context(self.session.id).await?;
        let mut messages = Vec::with_capacity(context.len() + 1);
        if !self.agent.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.agent.system_prompt.clone()));
        }
        for m in context {
            messages.push(ChatMessage {
                role: m.role,
                content: m.content,
            });
        }
        Ok(GenerateRequest {
            messages,
            model: self.agent.model.clone(),
            temperature: self.agent.temperature,
            max_tokens: config.llm.max_tokens,
            user_id: self.session.user_id.clone(),
        })
    }
}

/// Bounded two-step finalization: request the terminal final, wait out
/// the deadline, fall back to the best partial.
async fn finalize_transcript(stt: &mut SttStream, partial: String, deadline: Duration) -> String {
    let mut best = partial;
    if stt.finalize().await.is_err() {
        return best;
    }
    let wait = tokio::time::timeout(deadline, async {
        loop {
            match stt.next_event().await {
                SttEvent::Final(text) => return Some(text),
                SttEvent::Partial(text) => best = text,
                SttEvent::Ready => {}
                SttEvent::EngineError(_) | SttEvent::Disconnected(_) => return None,
            }
        }
    })
    .await;
    match wait {
        Ok(Some(text)) => text,
        _ => best,
    }
}

/// Whisper-family engines emit bracketed annotations for non-speech
/// audio; those and punctuation-only strings are not conversation turns.
fn is_blank_transcript(text: &str) -> bool {
    let t = text.trim();
    if t.is_empty() || t.chars().all(|c| !c.is_alphanumeric()) {
        return true;
    }
    const NON_SPEECH: &[&str] = &[
        "[blank_audio]",
        "[silence]",
        "(silence)",
        "[inaudible]",
        "[no speech]",
        "(no speech)",
        "[music]",
        "[noise]",
    ];
    NON_SPEECH.contains(&t.to_ascii_lowercase().as_str())
}
