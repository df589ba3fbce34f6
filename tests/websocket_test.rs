//! End-to-end tests over a real WebSocket connection.

mod common;

use common::{Client, TempDir, TestServer};
use serde_json::json;
use tokio_tungstenite::tungstenite::http::StatusCode;

#[tokio::test]
async fn test_initial_sync_on_connect() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;

    let mut client = Client::connect(&server.ws_url()).await;
    let tags = client.recv().await;
    assert_eq!(tags["type"], "TAG_LIST");
    assert_eq!(tags["id"], "");
    assert_eq!(tags["status"], "");
    assert_eq!(tags["payload"][0]["id"], 1);
    assert_eq!(tags["payload"][0]["name"], "Archived");
    assert_eq!(tags["payload"][0]["color"], "#adadad");

    let summaries = client.recv().await;
    assert_eq!(summaries["type"], "SUMMARY_LIST");
    assert_eq!(summaries["payload"], json!([]));
    client.assert_silent().await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tag_new_is_broadcast_to_every_client() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(server.client().await);
    }

    clients[0]
        .action("42", "TAG_NEW", json!({"name": "Work", "color": "#ff0000"}))
        .await;

    // The requester sees the broadcast before its acknowledgement.
    let update = clients[0].recv().await;
    assert_eq!(update["type"], "TAG_UPDATE");
    assert_eq!(update["payload"]["name"], "Work");
    let ack = clients[0].recv().await;
    assert_eq!(ack["type"], "ACTION_EXECUTED");
    assert_eq!(ack["status"], "OK");
    assert_eq!(ack["id"], "42");

    for client in clients.iter_mut().skip(1) {
        let update = client.recv().await;
        assert_eq!(update["type"], "TAG_UPDATE");
        assert_eq!(update["payload"]["color"], "#ff0000");
        client.assert_silent().await;
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_action_is_rejected() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;
    let mut b = server.client().await;

    a.action("3", "FOO", json!(null)).await;

    let reply = a.recv().await;
    assert_eq!(reply["type"], "ACTION_EXECUTED");
    assert_eq!(reply["status"], "ERROR");
    assert_eq!(reply["id"], "3");
    assert_eq!(reply["payload"], "Unsupported action: FOO");
    b.assert_silent().await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_tag_name_is_an_error() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;

    a.action("1", "TAG_NEW", json!({"name": "Archived", "color": "#000000"}))
        .await;

    let reply = a.recv().await;
    assert_eq!(reply["status"], "ERROR");
    assert_eq!(reply["id"], "1");
    a.assert_silent().await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_project_lifecycle() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;

    a.action(
        "1",
        "PROJECT_NEW",
        json!({"name": "Garden", "tags": [1], "description": "Raised beds"}),
    )
    .await;
    let summary = a.recv().await;
    assert_eq!(summary["type"], "SUMMARY_UPDATE");
    assert_eq!(summary["payload"]["title"], "Garden");
    let project = summary["payload"]["id"].clone();
    let tag = a.recv().await;
    assert_eq!(tag["type"], "TAG_UPDATE");
    assert_eq!(tag["payload"]["numProjects"], 1);
    assert_eq!(a.recv().await["status"], "OK");

    a.action(
        "2",
        "TASK_NEW",
        json!({"projectId": project, "title": "Dig", "description": "", "priority": 2}),
    )
    .await;
    assert_eq!(a.recv().await["type"], "PROJECT_UPDATE");
    let summary = a.recv().await;
    assert_eq!(summary["type"], "SUMMARY_UPDATE");
    assert_eq!(summary["payload"]["completeness"], 0.0);
    assert_eq!(a.recv().await["status"], "OK");

    a.action("3", "PROJECT_GET", project.clone()).await;
    let reply = a.recv().await;
    assert_eq!(reply["type"], "ACTION_EXECUTED");
    assert_eq!(reply["status"], "OK");
    assert_eq!(reply["payload"]["description"], "Raised beds");
    let task = reply["payload"]["tasks"][0]["id"].clone();

    a.action("4", "TASK_TOGGLE", task).await;
    assert_eq!(a.recv().await["type"], "PROJECT_UPDATE");
    let summary = a.recv().await;
    assert_eq!(summary["payload"]["completeness"], 1.0);
    assert_eq!(a.recv().await["status"], "OK");

    a.action("5", "PROJECT_DELETE", project.clone()).await;
    let deleted = a.recv().await;
    assert_eq!(deleted["type"], "PROJECT_DELETE");
    assert_eq!(deleted["payload"], project);
    let tag = a.recv().await;
    assert_eq!(tag["type"], "TAG_UPDATE");
    assert_eq!(tag["payload"]["numProjects"], 0);
    assert_eq!(a.recv().await["status"], "OK");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;

    a.send_text("this is not json").await;
    a.assert_silent().await;

    a.action("1", "TAG_NEW", json!({"name": "Work", "color": "#ff0000"}))
        .await;
    assert_eq!(a.recv().await["type"], "TAG_UPDATE");
    assert_eq!(a.recv().await["status"], "OK");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnected_client_is_dropped() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;
    let b = server.client().await;
    server.wait_for_connections(2).await;

    b.close().await;
    server.wait_for_connections(1).await;

    a.action("1", "TAG_NEW", json!({"name": "Work", "color": "#ff0000"}))
        .await;
    assert_eq!(a.recv().await["type"], "TAG_UPDATE");
    assert_eq!(a.recv().await["status"], "OK");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_sockets() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;

    server.stop().await.unwrap();
    assert!(a.try_recv().await.is_none());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let data = TempDir::new().unwrap();

    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;
    a.action("1", "TAG_NEW", json!({"name": "Work", "color": "#ff0000"}))
        .await;
    a.recv().await;
    assert_eq!(a.recv().await["status"], "OK");
    server.stop().await.unwrap();

    let server = TestServer::start(data.path()).await;
    let mut b = Client::connect(&server.ws_url()).await;
    let tags = b.recv().await;
    assert_eq!(tags["type"], "TAG_LIST");
    let names: Vec<_> = tags["payload"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"Work".to_string()));
    assert!(names.contains(&"Archived".to_string()));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_closing_mid_burst_does_not_disturb_others() {
    const BURST: usize = 20;
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;
    let b = server.client().await;
    let mut c = server.client().await;
    server.wait_for_connections(3).await;

    for i in 0..BURST {
        a.action(
            &i.to_string(),
            "TAG_NEW",
            json!({"name": format!("Tag {}", i), "color": "#00ff00"}),
        )
        .await;
    }
    b.close().await;

    for i in 0..BURST {
        let update = a.recv().await;
        assert_eq!(update["type"], "TAG_UPDATE");
        assert_eq!(update["payload"]["name"], format!("Tag {}", i));
        let ack = a.recv().await;
        assert_eq!(ack["status"], "OK");
        assert_eq!(ack["id"], i.to_string());
    }
    for i in 0..BURST {
        let update = c.recv().await;
        assert_eq!(update["payload"]["name"], format!("Tag {}", i));
    }
    c.assert_silent().await;
    server.wait_for_connections(2).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_id_is_an_error_reply() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;
    let mut a = server.client().await;

    a.action("1", "TAG_DELETE", json!(18446744073709551615u64)).await;
    let reply = a.recv().await;
    assert_eq!(reply["type"], "ACTION_EXECUTED");
    assert_eq!(reply["status"], "ERROR");
    a.assert_silent().await;

    // The controller is still serving.
    a.action("2", "TAG_NEW", json!({"name": "Work", "color": "#ff0000"}))
        .await;
    assert_eq!(a.recv().await["type"], "TAG_UPDATE");
    assert_eq!(a.recv().await["status"], "OK");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_cross_site_origin_is_refused() {
    let data = TempDir::new().unwrap();
    let server = TestServer::start(data.path()).await;

    let status = Client::handshake_status(&server.ws_url(), "https://evil.example").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let same_host = format!("http://{}", server.addr);
    let status = Client::handshake_status(&server.ws_url(), &same_host).await;
    assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);

    server.stop().await.unwrap();
}
