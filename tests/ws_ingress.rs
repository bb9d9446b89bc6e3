//! Browser WebSocket ingress, end to end: container-Opus chunks in,
//! transcript/response events and synthesized audio out, across two
//! turns on one connection (the container header arrives only once).

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{StubStt, StubSttScript, marked_wav, ogg_audio_page, ogg_opus_header, opus_packet, sse_body};
use voxgate::config::{ConfigHandle, GatewayConfig};
use voxgate::ingress::SessionEvent;
use voxgate::metrics::Metrics;
use voxgate::session::SessionSupervisor;
use voxgate::store::ConversationStore;
use voxgate::store::types::{Agent, ProviderKind};
use voxgate::tts::TtsClient;

const USER_TEXT: &str = "Turn me into text please.";
const REPLY_TEXT: &str = "Here is a spoken answer for you.";

#[derive(Default)]
struct ClientLog {
    events: Mutex<Vec<SessionEvent>>,
    audio_frames: Mutex<usize>,
}

impl ClientLog {
    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().expect("events lock").clone()
    }

    fn finals(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::FinalTranscript { .. }))
            .count()
    }

    fn completes(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::AiResponseComplete))
            .count()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn two_turns_on_one_connection() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(REPLY_TEXT, 4), "text/event-stream"),
        )
        .expect(2)
        .mount(&llm)
        .await;
    let tts = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(marked_wav(0xE5, 512)))
        .mount(&tts)
        .await;
    let stub_stt = StubStt::spawn(StubSttScript {
        partial_text: Some("Turn me".to_owned()),
        final_text: USER_TEXT.to_owned(),
    })
    .await;

    let mut config = GatewayConfig::default();
    config.turn.silence_threshold_ms = 150;
    config.stt.url = stub_stt.url();
    config.tts.url = tts.uri();
    config.tts.prebuffer_bytes = 64;
    config.llm.hosted.base_url = llm.uri();
    config.llm.fallback_provider = String::new();

    let store = ConversationStore::open_in_memory(&config.store).expect("store");
    store
        .create_agent(Agent::new(
            "concierge",
            "Short answers only.",
            ProviderKind::Hosted,
            "gpt-4o-mini",
        ))
        .await
        .expect("agent");
    let supervisor = SessionSupervisor::new(
        ConfigHandle::new(config),
        store.clone(),
        TtsClient::new(voxgate::config::TtsConfig {
            url: tts.uri(),
            prebuffer_bytes: 64,
            ..voxgate::config::TtsConfig::default()
        }),
        Metrics::new(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = voxgate::ingress::ws::router(Arc::clone(&supervisor));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let url = format!("ws://{addr}/ws/voice?user_id=web-user&agent=concierge");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.expect("connect");
    let (mut write, mut read) = ws.split();

    // Collect everything the server pushes.
    let log = Arc::new(ClientLog::default());
    {
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                match msg {
                    Message::Text(text) => {
                        if let Ok(event) = serde_json::from_str::<SessionEvent>(&text) {
                            log.events.lock().expect("events lock").push(event);
                        }
                    }
                    Message::Binary(_) => {
                        *log.audio_frames.lock().expect("audio lock") += 1;
                    }
                    _ => {}
                }
            }
        });
    }

    // -- Turn 1: header chunk first, then audio chunks --
    write
        .send(Message::Text(
            serde_json::json!({"type": "session_init", "audio_format": "opus"}).to_string(),
        ))
        .await
        .expect("session_init");
    write
        .send(Message::Binary(ogg_opus_header()))
        .await
        .expect("header chunk");
    let packet = opus_packet();
    for seq in 2..6u32 {
        write
            .send(Message::Binary(ogg_audio_page(seq, &packet)))
            .await
            .expect("audio chunk");
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    wait_for("turn 1 completion", Duration::from_secs(5), || {
        log.completes() == 1
    })
    .await;
    assert_eq!(log.finals(), 1, "turn 1 produced a transcript");
    assert!(
        *log.audio_frames.lock().expect("audio lock") > 0,
        "synthesized audio streamed back"
    );

    // -- Turn 2: same connection, no header chunk (recorder already
    // emitted it); the saved header must carry the decode --
    for seq in 6..10u32 {
        write
            .send(Message::Binary(ogg_audio_page(seq, &packet)))
            .await
            .expect("audio chunk");
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    wait_for("turn 2 completion", Duration::from_secs(5), || {
        log.completes() == 2
    })
    .await;
    assert_eq!(log.finals(), 2, "turn 2 decoded despite missing header");

    // Both turns persisted, user before assistant each time.
    let sessions_events = log.events();
    assert!(sessions_events.contains(&SessionEvent::TtsStart));
    let session = store
        .get_or_create_session("web-user", store.list_agents().await.expect("agents")[0].id, voxgate::store::types::IngressKind::Browser)
        .await
        .expect("session");
    let context = store.get_context(session.id).await.expect("context");
    assert_eq!(context.len(), 4);
    assert_eq!(context[0].content, USER_TEXT);
    assert_eq!(context[1].content, REPLY_TEXT);
    assert_eq!(context[2].content, USER_TEXT);
    assert_eq!(context[3].content, REPLY_TEXT);
}
