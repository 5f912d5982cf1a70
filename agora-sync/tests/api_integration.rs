//! Integration tests for the HTTP room API against a canned local responder.

mod common;

use agora_sync::api::{ApiError, HistoryQuery, HttpRoomApi, RoomApi};
use agora_sync::config::{Credentials, SyncConfig};
use common::MockHttp;

fn api_for(http: &MockHttp) -> HttpRoomApi {
    HttpRoomApi::new(&SyncConfig {
        api_base: http.base.clone(),
        credentials: Credentials::new("tok", "42"),
        ..SyncConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_join_sends_auth_and_unwraps_envelope() {
    let mut http = MockHttp::start(vec![(
        200,
        r#"{"data":{"room_id":"R1","peer_id":"p-9"}}"#,
    )])
    .await;
    let api = api_for(&http);

    let receipt = api.join("R1").await.unwrap();
    assert_eq!(receipt.room_id, "R1");
    assert_eq!(receipt.peer_id, "p-9");

    let request = http.request().await;
    assert!(request.starts_with("post /rooms/r1/join http/1.1"), "{request}");
    assert!(request.contains("authorization: bearer tok"));
    assert!(request.contains("x-user-id: 42"));
}

#[tokio::test]
async fn test_history_query_and_page() {
    let mut http = MockHttp::start(vec![(
        200,
        r#"{"data":{"items":[
            {"id":"m2","room_id":"R1","user_id":"7","text":"b","created_at":"2024-05-01T10:00:02Z"},
            {"id":"m1","room_id":"R1","user_id":"7","text":"a","created_at":"2024-05-01T10:00:01Z","reply_to":"m0"}
        ],"next_cursor":"abc="}}"#,
    )])
    .await;
    let api = api_for(&http);

    let page = api
        .history(
            "R1",
            &HistoryQuery {
                after: Some("xyz=".into()),
                limit: Some(20),
            },
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[1].reply_to.as_deref(), Some("m0"));
    assert_eq!(page.next_cursor.as_deref(), Some("abc="));

    let request = http.request().await;
    assert!(request.starts_with("get /rooms/r1/chat?after=xyz%3d&limit=20 "), "{request}");
}

#[tokio::test]
async fn test_last_history_page_has_no_cursor() {
    let http = MockHttp::start(vec![(200, r#"{"data":{"items":[]}}"#)]).await;
    let page = api_for(&http)
        .history("R1", &HistoryQuery::default())
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn test_participants_items() {
    let http = MockHttp::start(vec![(
        200,
        r#"{"data":{"items":[{"user_id":"5","joined_at":"2024-05-01T10:00:00Z","last_seen":"2024-05-01T10:01:00Z"}]}}"#,
    )])
    .await;
    let members = api_for(&http).participants("R1").await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].user_id, "5");
}

#[tokio::test]
async fn test_error_status_carries_server_message() {
    let http = MockHttp::start(vec![(
        409,
        r#"{"error":{"message":"join failed","meta":{"reason":"room is full"}}}"#,
    )])
    .await;
    let err = api_for(&http).join("R1").await.unwrap_err();
    match err {
        ApiError::Status { status, message } => {
            assert_eq!(status, 409);
            assert_eq!(message, "join failed: room is full");
        }
        other => panic!("expected status error, got {other}"),
    }
}

#[tokio::test]
async fn test_leave_accepts_no_content() {
    let mut http = MockHttp::start(vec![(204, "")]).await;
    api_for(&http).leave("R1").await.unwrap();
    let request = http.request().await;
    assert!(request.starts_with("post /rooms/r1/leave "));
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    let port = common::free_port().await;
    let api = HttpRoomApi::new(&SyncConfig {
        api_base: format!("http://127.0.0.1:{port}"),
        ..SyncConfig::default()
    })
    .unwrap();
    let err = api.participants("R1").await.unwrap_err();
    assert!(matches!(err, ApiError::Network(_)));
}
