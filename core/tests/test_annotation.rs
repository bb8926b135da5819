/// Annotation lifecycle against a scripted backend
mod common;

use agebridge_core::protocol::{AnalysisResponse, InboundFrame};
use agebridge_core::{
    AnalysisKind, AnnotationCoordinator, AnnotationError, AnnotationState, MessageStore, Role, TransportError,
};
use common::{eventually, FakeBackend};
use std::sync::Arc;
use std::time::Duration;

async fn text_frame(store: &MessageStore, id: &str, from: &str, body: &str) {
    let json = format!(
        r#"{{"id":"{}","from":"{}","to":"x","pair_id":"9","type":"text","message":"{}"}}"#,
        id, from, body
    );
    store.ingest_live(InboundFrame::parse(&json).unwrap()).await.unwrap();
}

async fn image_frame(store: &MessageStore, id: &str, from: &str, url: &str) {
    let json = format!(
        r#"{{"id":"{}","from":"{}","pair_id":"9","type":"image","image_data":"{}"}}"#,
        id, from, url
    );
    store.ingest_live(InboundFrame::parse(&json).unwrap()).await.unwrap();
}

fn coordinator(store: &MessageStore, backend: &Arc<FakeBackend>) -> AnnotationCoordinator {
    AnnotationCoordinator::new(store.clone(), backend.clone(), Role::Young, 5)
}

#[tokio::test]
async fn test_second_request_while_pending_is_a_no_op() {
    let store = MessageStore::new();
    let backend = Arc::new(FakeBackend::default());
    backend.set_analysis_delay(Duration::from_millis(200));
    text_frame(&store, "m1", "elder_9", "I feel tired today").await;
    let annotations = coordinator(&store, &backend);

    assert!(annotations.request_annotation("m1", AnalysisKind::Text).await.unwrap());
    assert_eq!(
        store.get_message("m1").await.unwrap().annotation.state,
        AnnotationState::Pending
    );
    assert!(!annotations.request_annotation("m1", AnalysisKind::Text).await.unwrap());

    eventually("annotation result", || async {
        store.get_message("m1").await.unwrap().annotation.state == AnnotationState::Result
    })
    .await;

    let annotation = store.get_message("m1").await.unwrap().annotation;
    assert_eq!(annotation.content.as_deref(), Some("friendly greeting"));
    assert_eq!(backend.analyze_calls(), 1);

    let sent = backend.text_requests.lock().unwrap().clone();
    assert_eq!(sent[0].text, "I feel tired today");
    assert_eq!(sent[0].role, Role::Young);
}

#[tokio::test]
async fn test_failed_analysis_can_be_requested_again() {
    let store = MessageStore::new();
    let backend = Arc::new(FakeBackend::default());
    text_frame(&store, "m1", "young_9", "ok boomer").await;
    let annotations = coordinator(&store, &backend);

    backend.set_analysis(Ok(AnalysisResponse::failure("model unavailable")));
    let first = annotations.annotate("m1", AnalysisKind::Text).await.unwrap().unwrap();
    assert_eq!(first.state, AnnotationState::Error);
    assert_eq!(first.error_message.as_deref(), Some("model unavailable"));

    backend.set_analysis(Ok(AnalysisResponse::success("slang, means dismissive")));
    let second = annotations.annotate("m1", AnalysisKind::Text).await.unwrap().unwrap();
    assert_eq!(second.state, AnnotationState::Result);
    assert_eq!(second.content.as_deref(), Some("slang, means dismissive"));
    assert_eq!(store.get_message("m1").await.unwrap().annotation, second);
    assert_eq!(backend.analyze_calls(), 2);
}

#[tokio::test]
async fn test_transport_failure_surfaces_server_detail() {
    let store = MessageStore::new();
    let backend = Arc::new(FakeBackend::default());
    text_frame(&store, "m1", "young_9", "hello").await;
    backend.set_analysis(Err(TransportError::Status {
        status: 500,
        detail: Some("analysis backend down".to_string()),
    }));

    let annotation = coordinator(&store, &backend)
        .annotate("m1", AnalysisKind::Text)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(annotation.state, AnnotationState::Error);
    assert_eq!(annotation.error_message.as_deref(), Some("analysis backend down"));
}

#[tokio::test]
async fn test_context_is_latest_window_without_target() {
    let store = MessageStore::new();
    let backend = Arc::new(FakeBackend::default());
    for i in 1..=6 {
        text_frame(&store, &format!("m{}", i), "elder_9", &format!("line {}", i)).await;
    }
    image_frame(&store, "m7", "young_9", "http://media.local/cat.png").await;
    text_frame(&store, "m8", "young_9", "what do you think?").await;

    coordinator(&store, &backend)
        .annotate("m8", AnalysisKind::Text)
        .await
        .unwrap();

    let sent = backend.text_requests.lock().unwrap().clone();
    // The target occupies one of the five most recent slots
    assert_eq!(sent[0].context, vec!["line 4", "line 5", "line 6", "[image]"]);
}

#[tokio::test]
async fn test_image_analysis_sends_the_url() {
    let store = MessageStore::new();
    let backend = Arc::new(FakeBackend::default());
    text_frame(&store, "m1", "elder_9", "look at this").await;
    image_frame(&store, "m2", "young_9", "http://media.local/meme.png").await;

    let annotation = coordinator(&store, &backend)
        .annotate("m2", AnalysisKind::Image)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(annotation.state, AnnotationState::Result);

    let sent = backend.emoji_requests.lock().unwrap().clone();
    assert_eq!(sent[0].image_url, "http://media.local/meme.png");
    assert_eq!(sent[0].context, vec!["look at this"]);
}

#[tokio::test]
async fn test_rejected_requests_leave_state_alone() {
    let store = MessageStore::new();
    let backend = Arc::new(FakeBackend::default());
    image_frame(&store, "m1", "young_9", "http://media.local/meme.png").await;
    let annotations = coordinator(&store, &backend);

    assert_eq!(
        annotations.request_annotation("missing", AnalysisKind::Text).await,
        Err(AnnotationError::UnknownMessage("missing".to_string()))
    );
    assert!(matches!(
        annotations.request_annotation("m1", AnalysisKind::Text).await,
        Err(AnnotationError::UnsupportedKind { .. })
    ));
    assert_eq!(
        store.get_message("m1").await.unwrap().annotation.state,
        AnnotationState::None
    );
    assert_eq!(backend.analyze_calls(), 0);
}

#[tokio::test]
async fn test_response_after_history_reload_is_dropped() {
    let store = MessageStore::new();
    let backend = Arc::new(FakeBackend::default());
    backend.set_analysis_delay(Duration::from_millis(150));
    text_frame(&store, "m1", "elder_9", "good morning").await;
    let annotations = coordinator(&store, &backend);

    assert!(annotations.request_annotation("m1", AnalysisKind::Text).await.unwrap());

    // Reconnect refresh replaces the log while the request is in flight
    let mut fresh = store.get().await;
    fresh[0].annotation = Default::default();
    store.ingest_history(fresh).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(backend.analyze_calls(), 1);
    assert_eq!(
        store.get_message("m1").await.unwrap().annotation.state,
        AnnotationState::None
    );
}

#[tokio::test]
async fn test_unrelated_messages_annotate_concurrently() {
    let store = MessageStore::new();
    let backend = Arc::new(FakeBackend::default());
    backend.set_analysis_delay(Duration::from_millis(100));
    text_frame(&store, "m1", "elder_9", "one").await;
    text_frame(&store, "m2", "young_9", "two").await;
    let annotations = coordinator(&store, &backend);

    let (a, b) = tokio::join!(
        annotations.annotate("m1", AnalysisKind::Text),
        annotations.annotate("m2", AnalysisKind::Text)
    );
    assert_eq!(a.unwrap().unwrap().state, AnnotationState::Result);
    assert_eq!(b.unwrap().unwrap().state, AnnotationState::Result);
    assert_eq!(backend.analyze_calls(), 2);
}
