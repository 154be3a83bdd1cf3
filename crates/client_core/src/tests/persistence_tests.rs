use super::*;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::TimeZone;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ApiState {
    inserts: Arc<Mutex<Vec<NewMessageRequest>>>,
    read_markers: Arc<Mutex<Vec<ReadMarkerRequest>>>,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn stored_record() -> MessageRecord {
    MessageRecord {
        id: MessageId::new("srv-1"),
        conversation_id: ConversationId::new("c1"),
        sender_id: UserId::new("u1"),
        content: "hello".to_string(),
        reply_to_id: None,
        attachments: Vec::new(),
        created_at: t0(),
        edited_at: None,
    }
}

async fn handle_insert(
    State(state): State<ApiState>,
    Json(request): Json<NewMessageRequest>,
) -> Json<MessageRecord> {
    let record = MessageRecord {
        id: MessageId::new("srv-1"),
        conversation_id: request.conversation_id.clone(),
        sender_id: request.sender_id.clone(),
        content: request.content.clone(),
        reply_to_id: request.reply_to_id.clone(),
        attachments: request.attachments.clone(),
        created_at: t0(),
        edited_at: None,
    };
    state.inserts.lock().await.push(request);
    Json(record)
}

async fn handle_update(Path(id): Path<String>) -> axum::response::Response {
    use axum::response::IntoResponse;
    match id.as_str() {
        // Envelope rejection, the shape the real API produces.
        "missing" => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found("message gone")),
        )
            .into_response(),
        // Proxy-style failure with a non-envelope body.
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        _ => {
            let mut record = stored_record();
            record.content = "hello, edited".to_string();
            record.edited_at = Some(t0() + chrono::Duration::seconds(5));
            Json(record).into_response()
        }
    }
}

async fn handle_delete(Path(_id): Path<String>) -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_get_conversation(Path(id): Path<String>) -> Json<ConversationRecord> {
    Json(ConversationRecord {
        id: ConversationId::new(id),
        kind: shared::domain::ConversationKind::Group,
        participant_count: 3,
    })
}

async fn handle_list_messages() -> Json<Vec<MessageRecord>> {
    Json(vec![stored_record()])
}

async fn handle_list_participants() -> Json<Vec<ParticipantRecord>> {
    Json(vec![
        ParticipantRecord {
            user_id: UserId::new("u1"),
            last_read_at: Some(t0()),
        },
        ParticipantRecord {
            user_id: UserId::new("u2"),
            last_read_at: None,
        },
    ])
}

async fn handle_read_marker(
    State(state): State<ApiState>,
    Json(request): Json<ReadMarkerRequest>,
) -> StatusCode {
    state.read_markers.lock().await.push(request);
    StatusCode::NO_CONTENT
}

async fn spawn_api_server() -> Result<(String, ApiState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ApiState::default();
    let app = Router::new()
        .route("/messages", post(handle_insert))
        .route("/messages/:id", patch(handle_update))
        .route("/messages/:id", delete(handle_delete))
        .route("/conversations/:id", get(handle_get_conversation))
        .route("/conversations/:id/messages", get(handle_list_messages))
        .route(
            "/conversations/:id/participants",
            get(handle_list_participants),
        )
        .route("/conversations/:id/read_marker", post(handle_read_marker))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ApiError>().is_some_and(ApiError::is_not_found))
}

#[tokio::test]
async fn insert_message_posts_body_and_decodes_record() {
    let (server_url, state) = spawn_api_server().await.expect("spawn server");
    let api = HttpPersistence::new(server_url);

    let record = api
        .insert_message(NewMessageRequest {
            conversation_id: ConversationId::new("c1"),
            sender_id: UserId::new("u1"),
            content: "hello".to_string(),
            reply_to_id: Some(MessageId::new("m0")),
            attachments: vec!["file.png".to_string()],
        })
        .await
        .expect("insert");

    assert_eq!(record.id, MessageId::new("srv-1"));
    assert_eq!(record.created_at, t0());

    let inserts = state.inserts.lock().await;
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].content, "hello");
    assert_eq!(inserts[0].reply_to_id, Some(MessageId::new("m0")));
    assert_eq!(inserts[0].attachments, vec!["file.png".to_string()]);
}

#[tokio::test]
async fn update_message_applies_server_edit() {
    let (server_url, _state) = spawn_api_server().await.expect("spawn server");
    let api = HttpPersistence::new(server_url);

    let record = api
        .update_message(&MessageId::new("srv-1"), "hello, edited")
        .await
        .expect("update");
    assert_eq!(record.content, "hello, edited");
    assert!(record.edited_at.is_some());
}

#[tokio::test]
async fn rejection_envelope_surfaces_as_api_error() {
    let (server_url, _state) = spawn_api_server().await.expect("spawn server");
    let api = HttpPersistence::new(server_url);

    let err = api
        .update_message(&MessageId::new("missing"), "whatever")
        .await
        .expect_err("should reject");
    assert!(not_found(&err));
}

#[tokio::test]
async fn non_envelope_failure_maps_status_to_code() {
    let (server_url, _state) = spawn_api_server().await.expect("spawn server");
    let api = HttpPersistence::new(server_url);

    let err = api
        .update_message(&MessageId::new("broken"), "whatever")
        .await
        .expect_err("should fail");
    assert!(!not_found(&err));
    let envelope = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ApiError>())
        .expect("envelope in chain");
    assert_eq!(envelope.code, ErrorCode::Internal);
}

#[tokio::test]
async fn listing_endpoints_decode_records() {
    let (server_url, _state) = spawn_api_server().await.expect("spawn server");
    let api = HttpPersistence::new(server_url);

    let conversation = api
        .get_conversation(&ConversationId::new("c1"))
        .await
        .expect("conversation");
    assert_eq!(conversation.participant_count, 3);

    let messages = api
        .list_messages(&ConversationId::new("c1"))
        .await
        .expect("messages");
    assert_eq!(messages, vec![stored_record()]);

    let participants = api
        .list_participants(&ConversationId::new("c1"))
        .await
        .expect("participants");
    assert_eq!(participants.len(), 2);
    assert_eq!(participants[1].user_id, UserId::new("u2"));
    assert!(participants[1].last_read_at.is_none());
}

#[tokio::test]
async fn touch_last_read_posts_marker_for_user() {
    let (server_url, state) = spawn_api_server().await.expect("spawn server");
    let api = HttpPersistence::new(server_url);

    let at = t0() + chrono::Duration::seconds(42);
    api.touch_last_read(&ConversationId::new("c1"), &UserId::new("u1"), at)
        .await
        .expect("read marker");
    api.delete_message(&MessageId::new("srv-1"))
        .await
        .expect("delete");

    let markers = state.read_markers.lock().await;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].user_id, UserId::new("u1"));
    assert_eq!(markers[0].last_read_at, at);
}
