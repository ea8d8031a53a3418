//! End-to-end tests driving a full server over real transports with
//! the loopback engine behind it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use taskd_client::IpcClient;
use taskd_protocol::{Command, StartNewTaskPayload, TaskEvent};
use taskd_server::{BindTarget, EngineEvents, IpcServer, LoopbackEngine, ServerHandle};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(dir: &tempfile::TempDir) -> (ServerHandle, PathBuf) {
    let path = dir.path().join("taskd.sock");
    let (events, lifecycle) = EngineEvents::channel();
    let engine = Arc::new(LoopbackEngine::new(events));
    let server = IpcServer::new(BindTarget::Socket(path.clone()), engine, lifecycle);
    let handle = server.listen().await.expect("server failed to bind");
    (handle, path)
}

async fn connect(path: &PathBuf) -> IpcClient {
    timeout(WAIT, IpcClient::connect_unix(path))
        .await
        .expect("handshake timed out")
        .expect("connect failed")
}

/// Read events until one matches, buffering nothing else.
async fn wait_for<F>(client: &mut IpcClient, mut pred: F) -> TaskEvent
where
    F: FnMut(&TaskEvent) -> bool,
{
    loop {
        let event = timeout(WAIT, client.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("event stream failed");
        if pred(&event) {
            return event;
        }
    }
}

/// Poll a query until the response satisfies the predicate. Mutations
/// are fire-and-forget, so observing their effect may take a moment.
async fn poll_until<F>(client: &mut IpcClient, command: Command, mut pred: F) -> Value
where
    F: FnMut(&Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let value = client.request(command.clone()).await.expect("query failed");
        if pred(&value) {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "query never reached expected value, last: {}",
            value
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn start_request(text: &str) -> Command {
    Command::StartNewTask(StartNewTaskPayload {
        text: Some(text.to_string()),
        ..Default::default()
    })
}

#[tokio::test]
async fn handshake_assigns_client_identity() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;

    let client = connect(&path).await;
    assert_eq!(client.client_id().len(), 12);
    assert!(client.client_id().chars().all(|c| c.is_ascii_hexdigit()));
    assert!(client.ack().pid > 0);

    handle.shutdown();
}

#[tokio::test]
async fn concurrent_connects_get_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(connect(&path).await);
    }
    let ids: std::collections::HashSet<_> =
        clients.iter().map(|c| c.client_id().to_string()).collect();
    assert_eq!(ids.len(), 5);

    handle.shutdown();
}

#[tokio::test]
async fn task_lifecycle_broadcasts_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;
    let mut client = connect(&path).await;

    client.send(start_request("hello world")).await.unwrap();

    let created = wait_for(&mut client, |e| matches!(e, TaskEvent::TaskCreated(_))).await;
    let TaskEvent::TaskCreated(task_id) = created else {
        unreachable!()
    };

    let started = wait_for(&mut client, |e| matches!(e, TaskEvent::TaskStarted(_))).await;
    assert!(matches!(started, TaskEvent::TaskStarted(id) if id == task_id));

    let message = wait_for(&mut client, |e| matches!(e, TaskEvent::Message(_))).await;
    let TaskEvent::Message(payload) = message else {
        unreachable!()
    };
    assert_eq!(payload.task_id, task_id);
    assert_eq!(payload.message["text"], "hello world");
    assert!(!payload.partial);

    let completed =
        wait_for(&mut client, |e| matches!(e, TaskEvent::TaskCompleted(..))).await;
    let TaskEvent::TaskCompleted(id, usage, _tools) = completed else {
        unreachable!()
    };
    assert_eq!(id, task_id);
    assert!(usage.total_tokens_in > 0);

    // Once the run is over the task is in history but no longer active.
    let in_history = client
        .request(Command::IsTaskInHistory(task_id.clone()))
        .await
        .unwrap();
    assert_eq!(in_history, json!(true));
    let stack = client.request(Command::GetCurrentTaskStack).await.unwrap();
    assert_eq!(stack, json!([]));

    handle.shutdown();
}

#[tokio::test]
async fn queries_answer_the_requesting_client() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;
    let mut client = connect(&path).await;

    let ready = client.request(Command::IsReady).await.unwrap();
    assert_eq!(ready, json!(true));

    let unknown = client
        .request(Command::IsTaskInHistory("no-such-task".into()))
        .await
        .unwrap();
    assert_eq!(unknown, json!(false));

    let messages = client
        .request(Command::GetMessages("no-such-task".into()))
        .await
        .unwrap();
    assert_eq!(messages, json!([]));

    let usage = client
        .request(Command::GetTokenUsage("no-such-task".into()))
        .await
        .unwrap();
    assert_eq!(usage, Value::Null);

    handle.shutdown();
}

#[tokio::test]
async fn profile_mutations_visible_across_clients() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;
    let mut writer = connect(&path).await;
    let mut reader = connect(&path).await;

    writer.send(Command::CreateProfile("alpha".into())).await.unwrap();
    writer
        .send(Command::SetActiveProfile("alpha".into()))
        .await
        .unwrap();

    poll_until(&mut reader, Command::GetActiveProfile, |v| {
        v == &json!("alpha")
    })
    .await;
    let profiles = reader.request(Command::GetProfiles).await.unwrap();
    assert_eq!(profiles, json!(["alpha"]));

    handle.shutdown();
}

#[tokio::test]
async fn deleting_missing_profile_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;
    let mut client = connect(&path).await;

    client.send(Command::CreateProfile("keeper".into())).await.unwrap();
    poll_until(&mut client, Command::GetProfiles, |v| v == &json!(["keeper"])).await;

    client
        .send(Command::DeleteProfile("no-such-profile".into()))
        .await
        .unwrap();

    // The failure is logged server-side; state is untouched.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let profiles = client.request(Command::GetProfiles).await.unwrap();
    assert_eq!(profiles, json!(["keeper"]));

    handle.shutdown();
}

#[tokio::test]
async fn configuration_updates_merge() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;
    let mut client = connect(&path).await;

    let mut values = serde_json::Map::new();
    values.insert("mode".into(), json!("code"));
    client.send(Command::SetConfiguration(values)).await.unwrap();

    poll_until(&mut client, Command::GetConfiguration, |v| {
        v.get("mode") == Some(&json!("code"))
    })
    .await;

    handle.shutdown();
}

#[tokio::test]
async fn broadcast_reaches_every_client_despite_dropout() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;

    let mut sender = connect(&path).await;
    let mut observer = connect(&path).await;
    let dropout = connect(&path).await;

    // One client vanishes without a goodbye.
    drop(dropout);

    sender.send(start_request("fan-out")).await.unwrap();

    let created = wait_for(&mut sender, |e| matches!(e, TaskEvent::TaskCreated(_))).await;
    let TaskEvent::TaskCreated(task_id) = created else {
        unreachable!()
    };
    let seen = wait_for(&mut observer, |e| matches!(e, TaskEvent::TaskCreated(_))).await;
    assert!(matches!(seen, TaskEvent::TaskCreated(id) if id == task_id));

    // The surviving clients keep receiving later events too.
    wait_for(&mut sender, |e| matches!(e, TaskEvent::TaskCompleted(..))).await;
    wait_for(&mut observer, |e| matches!(e, TaskEvent::TaskCompleted(..))).await;

    handle.shutdown();
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;

    let stream = UnixStream::connect(&path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let ack_line = timeout(WAIT, lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .expect("no ack received");
    let ack: Value = serde_json::from_str(&ack_line).unwrap();
    assert_eq!(ack["type"], "Ack");
    let client_id = ack["data"]["clientId"].as_str().unwrap().to_string();

    // Garbage, then a schema-invalid command, then a valid query.
    write_half.write_all(b"this is not json\n").await.unwrap();
    write_half
        .write_all(b"{\"type\":\"TaskCommand\",\"origin\":\"client\",\"clientId\":\"x\",\"data\":{\"commandName\":\"NoSuchCommand\"}}\n")
        .await
        .unwrap();
    let query = format!(
        "{{\"type\":\"TaskCommand\",\"origin\":\"client\",\"clientId\":\"{}\",\"data\":{{\"requestId\":\"r1\",\"commandName\":\"IsReady\"}}}}\n",
        client_id
    );
    write_half.write_all(query.as_bytes()).await.unwrap();

    let response_line = timeout(WAIT, lines.next_line())
        .await
        .expect("connection dropped after malformed input")
        .unwrap()
        .expect("stream closed");
    let response: Value = serde_json::from_str(&response_line).unwrap();
    assert_eq!(response["type"], "TaskEvent");
    assert_eq!(response["data"]["eventName"], "CommandResponse");
    let payload = &response["data"]["payload"][0];
    assert_eq!(payload["requestId"], "r1");
    assert_eq!(payload["commandName"], "IsReady");
    assert_eq!(payload["payload"], json!(true));

    handle.shutdown();
}

#[tokio::test]
async fn tcp_transport_serves_the_same_protocol() {
    let (events, lifecycle) = EngineEvents::channel();
    let engine = Arc::new(LoopbackEngine::new(events));
    let server = IpcServer::new(
        BindTarget::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        },
        engine,
        lifecycle,
    );
    let handle = server.listen().await.expect("tcp bind failed");
    let addr = handle.local_addr.expect("no resolved address");

    let mut client = timeout(WAIT, IpcClient::connect_tcp(addr))
        .await
        .expect("handshake timed out")
        .expect("connect failed");
    assert_eq!(client.client_id().len(), 12);

    let ready = client.request(Command::IsReady).await.unwrap();
    assert_eq!(ready, json!(true));

    client.send(start_request("over tcp")).await.unwrap();
    wait_for(&mut client, |e| matches!(e, TaskEvent::TaskCompleted(..))).await;

    handle.shutdown();
}

#[tokio::test]
async fn graceful_disconnect_unregisters_client() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, path) = start_server(&dir).await;

    let polite = connect(&path).await;
    let mut witness = connect(&path).await;
    assert_eq!(handle.clients().len(), 2);

    polite.close().await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while handle.clients().len() != 1 {
        assert!(tokio::time::Instant::now() < deadline, "client never removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The remaining client still works.
    let ready = witness.request(Command::IsReady).await.unwrap();
    assert_eq!(ready, json!(true));

    handle.shutdown();
}
