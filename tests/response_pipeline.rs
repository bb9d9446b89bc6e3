//! Response pipeline tests: playback ordering under parallel synthesis,
//! error policies, interruption, and progressive delivery, against a mock
//! TTS engine.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{CollectSink, marked_wav, marker_positions};
use voxgate::config::{ErrorStrategy, InterruptionStrategy, PipelineConfig, TtsConfig};
use voxgate::ingress::SessionEvent;
use voxgate::llm::TokenStream;
use voxgate::metrics::Metrics;
use voxgate::pipeline::{ResponsePipeline, TurnOutcome};
use voxgate::tts::{TtsClient, VoiceConfig};

const REPLY: &str = "Alpha unit comes first here. Bravo unit comes second here. Charlie unit comes third here.";

fn token_stream(text: &str, n: usize) -> TokenStream {
    let chars: Vec<char> = text.chars().collect();
    let per = chars.len().div_ceil(n.max(1));
    let chunks: Vec<voxgate::Result<String>> = chars
        .chunks(per)
        .map(|c| Ok(c.iter().collect::<String>()))
        .collect();
    TokenStream::new(stream::iter(chunks))
}

fn tts_client(server: &MockServer) -> TtsClient {
    TtsClient::new(TtsConfig {
        url: server.uri(),
        request_timeout_ms: 5_000,
        max_attempts: 2,
        prebuffer_bytes: 64,
        ..TtsConfig::default()
    })
}

fn pipeline_config(error: ErrorStrategy, interruption: InterruptionStrategy) -> PipelineConfig {
    PipelineConfig {
        error_strategy: error,
        interruption_strategy: interruption,
        ..PipelineConfig::default()
    }
}

struct Harness {
    sink: Arc<CollectSink>,
    interrupt_tx: watch::Sender<bool>,
    interrupt_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        Self {
            sink: CollectSink::new(),
            interrupt_tx,
            interrupt_rx,
            cancel: CancellationToken::new(),
        }
    }
}

#[tokio::test]
async fn audio_plays_in_unit_order_despite_parallel_synthesis() {
    let server = MockServer::start().await;
    // The first unit is the slowest; ordering must still hold.
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("Alpha"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(300))
                .set_body_bytes(marked_wav(0xA1, 512)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("Bravo"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xB2, 512)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("Charlie"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xC3, 512)))
        .mount(&server)
        .await;

    let h = Harness::new();
    let pipeline = ResponsePipeline::new(
        tts_client(&server),
        pipeline_config(ErrorStrategy::Skip, InterruptionStrategy::Graceful),
        Metrics::new(),
    );
    let report = pipeline
        .run(
            token_stream(REPLY, 10),
            VoiceConfig::default(),
            Arc::clone(&h.sink) as _,
            Arc::clone(&h.sink) as _,
            h.interrupt_rx.clone(),
            h.cancel.clone(),
        )
        .await;

    assert_eq!(report.outcome, TurnOutcome::Completed);
    assert_eq!(report.units_total, 3);
    assert_eq!(report.units_played, 3);
    assert_eq!(report.units_skipped, 0);
    assert_eq!(report.full_text, REPLY);
    assert!(report.llm_first_chunk_ms.is_some());

    let audio = h.sink.audio_bytes();
    let positions = marker_positions(&audio, &[0xA1, 0xB2, 0xC3]);
    let a = positions[0].expect("alpha played");
    let b = positions[1].expect("bravo played");
    let c = positions[2].expect("charlie played");
    assert!(a < b && b < c, "audio in submission order: {a} {b} {c}");

    let events = h.sink.events();
    assert!(events.contains(&SessionEvent::TtsStart));
    assert!(events.contains(&SessionEvent::AiResponseComplete));
    let chunk_text: String = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::AiResponseChunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_text, REPLY);
}

#[tokio::test]
async fn failed_unit_is_skipped_and_neighbours_play() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("Bravo"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("Alpha"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xA1, 256)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("Charlie"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xC3, 256)))
        .mount(&server)
        .await;

    let metrics = Metrics::new();
    let h = Harness::new();
    let pipeline = ResponsePipeline::new(
        tts_client(&server),
        pipeline_config(ErrorStrategy::Skip, InterruptionStrategy::Graceful),
        Arc::clone(&metrics),
    );
    let report = pipeline
        .run(
            token_stream(REPLY, 6),
            VoiceConfig::default(),
            Arc::clone(&h.sink) as _,
            Arc::clone(&h.sink) as _,
            h.interrupt_rx.clone(),
            h.cancel.clone(),
        )
        .await;

    assert_eq!(report.outcome, TurnOutcome::Completed);
    assert_eq!(report.units_played, 2);
    assert_eq!(report.units_skipped, 1);
    assert_eq!(metrics.snapshot().tts_units_skipped, 1);

    let audio = h.sink.audio_bytes();
    let positions = marker_positions(&audio, &[0xA1, 0xB2, 0xC3]);
    let a = positions[0].expect("alpha played");
    assert!(positions[1].is_none(), "failed unit leaves a gap");
    let c = positions[2].expect("charlie played");
    assert!(a < c);

    // The turn still completes for the listener.
    assert!(h.sink.events().contains(&SessionEvent::AiResponseComplete));
}

#[tokio::test]
async fn fallback_policy_uses_degraded_path_before_skipping() {
    let server = MockServer::start().await;
    // Mount order matters: the degraded request also contains "Bravo".
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("streaming_quality=fast"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xD4, 256)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("Bravo"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xA1, 256)))
        .mount(&server)
        .await;

    let h = Harness::new();
    let pipeline = ResponsePipeline::new(
        tts_client(&server),
        pipeline_config(ErrorStrategy::Fallback, InterruptionStrategy::Graceful),
        Metrics::new(),
    );
    let report = pipeline
        .run(
            token_stream(REPLY, 6),
            VoiceConfig::default(),
            Arc::clone(&h.sink) as _,
            Arc::clone(&h.sink) as _,
            h.interrupt_rx.clone(),
            h.cancel.clone(),
        )
        .await;

    assert_eq!(report.outcome, TurnOutcome::Completed);
    assert_eq!(report.units_played, 3);
    assert_eq!(report.units_skipped, 0);
    let audio = h.sink.audio_bytes();
    assert!(audio.contains(&0xD4), "degraded audio replaced the failure");
}

#[tokio::test]
async fn immediate_interruption_stops_before_playback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xA1, 256)))
        .mount(&server)
        .await;

    let h = Harness::new();
    h.interrupt_tx.send(true).expect("signal interrupt");
    let pipeline = ResponsePipeline::new(
        tts_client(&server),
        pipeline_config(ErrorStrategy::Skip, InterruptionStrategy::Immediate),
        Metrics::new(),
    );
    let report = pipeline
        .run(
            token_stream(REPLY, 6),
            VoiceConfig::default(),
            Arc::clone(&h.sink) as _,
            Arc::clone(&h.sink) as _,
            h.interrupt_rx.clone(),
            h.cancel.clone(),
        )
        .await;

    assert_eq!(report.outcome, TurnOutcome::Interrupted);
    assert_eq!(report.units_played, 0);
    assert!(h.sink.audio_bytes().is_empty());
}

#[tokio::test]
async fn drain_policy_ignores_interruption() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xA1, 256)))
        .mount(&server)
        .await;

    let h = Harness::new();
    h.interrupt_tx.send(true).expect("signal interrupt");
    let pipeline = ResponsePipeline::new(
        tts_client(&server),
        pipeline_config(ErrorStrategy::Skip, InterruptionStrategy::Drain),
        Metrics::new(),
    );
    let report = pipeline
        .run(
            token_stream(REPLY, 6),
            VoiceConfig::default(),
            Arc::clone(&h.sink) as _,
            Arc::clone(&h.sink) as _,
            h.interrupt_rx.clone(),
            h.cancel.clone(),
        )
        .await;

    assert_eq!(report.outcome, TurnOutcome::Completed);
    assert_eq!(report.units_played, 3);
}

#[tokio::test]
async fn first_audio_arrives_before_slow_tail_units() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_string_contains("Charlie"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(600))
                .set_body_bytes(marked_wav(0xC3, 256)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xA1, 256)))
        .mount(&server)
        .await;

    let h = Harness::new();
    let sink = Arc::clone(&h.sink);
    let pipeline = ResponsePipeline::new(
        tts_client(&server),
        pipeline_config(ErrorStrategy::Skip, InterruptionStrategy::Graceful),
        Metrics::new(),
    );
    let started = Instant::now();
    let first_audio = {
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            loop {
                if !sink.audio.lock().expect("audio lock").is_empty() {
                    return started.elapsed();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };
    let report = pipeline
        .run(
            token_stream(REPLY, 6),
            VoiceConfig::default(),
            Arc::clone(&h.sink) as _,
            Arc::clone(&h.sink) as _,
            h.interrupt_rx.clone(),
            h.cancel.clone(),
        )
        .await;
    let elapsed_to_first = first_audio.await.expect("first audio observed");

    assert_eq!(report.units_played, 3);
    assert!(
        elapsed_to_first < Duration::from_millis(450),
        "first unit played while the tail was still synthesizing ({elapsed_to_first:?})"
    );
}

#[tokio::test]
async fn short_reply_is_flushed_as_trailing_fragment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xA1, 128)))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new();
    let pipeline = ResponsePipeline::new(
        tts_client(&server),
        pipeline_config(ErrorStrategy::Skip, InterruptionStrategy::Graceful),
        Metrics::new(),
    );
    // No terminator at all: the whole reply is the trailing fragment.
    let report = pipeline
        .run(
            token_stream("Sure", 1),
            VoiceConfig::default(),
            Arc::clone(&h.sink) as _,
            Arc::clone(&h.sink) as _,
            h.interrupt_rx.clone(),
            h.cancel.clone(),
        )
        .await;

    assert_eq!(report.outcome, TurnOutcome::Completed);
    assert_eq!(report.units_total, 1);
    assert_eq!(report.units_played, 1);
    assert!(!h.sink.audio_bytes().is_empty());
}
