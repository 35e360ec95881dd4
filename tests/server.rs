use std::{
    io::Write,
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sift::{
    Catalog, Client, ClientError, Delivery, MemoryStore, QueryOutcome, Server, ServerConfig,
    SessionStore, SqliteStore,
    protocol::{MessageKind, Payload, ProtocolTransport, Received, Value},
};
use tempdir::TempDir;

fn test_config() -> ServerConfig {
    ServerConfig {
        poll_interval_ms: 20,
        drain_interval_ms: 20,
        accept_poll_ms: 10,
        max_message_size: 64 * 1024,
        ..Default::default()
    }
}

fn catalog() -> Catalog {
    Catalog::new()
        .with_query("echo", "Returns the query parameters", |params| {
            QueryOutcome::data(params.clone())
        })
        .with_metadata("areas", || {
            QueryOutcome::data(vec![Value::from("Central"), Value::from("Harbor")])
        })
}

fn start(store: Arc<dyn SessionStore>) -> (Server, SocketAddr) {
    let server = Server::new(test_config(), store, Arc::new(catalog()));
    let address = server.start("127.0.0.1", 0).unwrap();
    (server, address)
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn assert_closed(client: &mut Client) {
    for _ in 0..3 {
        match client.recv(Duration::from_secs(2)) {
            Ok(_) => continue,
            Err(ClientError::Closed | ClientError::Transport(_)) => return,
            Err(e) => panic!("expected a closed connection, got {e}"),
        }
    }
    panic!("connection still open");
}

fn registered(client: &mut Client, nickname: &str) -> String {
    let email = format!("{nickname}@example.com");
    let reply = client
        .register(nickname, nickname, &email, "secret")
        .unwrap();
    assert!(reply.is_ok(), "registration failed: {reply:?}");
    email
}

#[test]
fn login_query_logout_scenario() {
    let (server, address) = start(Arc::new(MemoryStore::new()));
    let mut client = Client::connect(address).unwrap();
    let email = registered(&mut client, "avery");

    let login = client.login(&email, "secret").unwrap();
    assert_eq!(login.kind(), &MessageKind::Login);
    assert!(login.is_ok());
    assert!(login.get("session_id").and_then(Value::as_int).is_some());
    assert_eq!(server.active_clients().len(), 1);

    let reply = client.query("no_such_query", Payload::new()).unwrap();
    assert_eq!(reply.kind(), &MessageKind::Error);
    assert!(reply.text("message").unwrap().contains("no_such_query"));

    let logout = client.logout().unwrap();
    assert_eq!(logout.kind(), &MessageKind::Logout);
    assert!(logout.is_ok());
    assert!(server.active_clients().is_empty());

    let greeting = client.take_notices();
    assert_eq!(greeting.len(), 1);
    assert_eq!(greeting[0].text("message"), Some("Connection accepted."));

    server.stop();
}

#[test]
fn duplicate_login_keeps_one_session() {
    let store = Arc::new(MemoryStore::new());
    let (server, address) = start(store.clone());
    let mut client = Client::connect(address).unwrap();
    let email = registered(&mut client, "blair");

    assert!(client.login(&email, "secret").unwrap().is_ok());
    let again = client.login(&email, "secret").unwrap();

    assert_eq!(again.kind(), &MessageKind::Error);
    assert_eq!(store.sessions().len(), 1);
    assert_eq!(server.active_clients().len(), 1);
}

#[test]
fn query_result_carries_data() {
    let (server, address) = start(Arc::new(MemoryStore::new()));
    let mut client = Client::connect(address).unwrap();
    let email = registered(&mut client, "casey");
    client.login(&email, "secret").unwrap();

    let mut params = Payload::new();
    params.insert("area".to_string(), Value::from("Harbor"));
    params.insert("raw".to_string(), Value::Bytes(vec![0, 159, 255]));
    let reply = client.query("echo", params).unwrap();

    assert_eq!(reply.kind(), &MessageKind::QueryResult);
    let data = reply.get("data").and_then(Value::as_map).unwrap();
    assert_eq!(data.get("raw"), Some(&Value::Bytes(vec![0, 159, 255])));

    let metadata = client.metadata("areas").unwrap();
    assert_eq!(metadata.text("metadata_type"), Some("areas"));

    let stats = server.query_stats().unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].description, "Returns the query parameters");
}

#[test]
fn broadcast_reaches_every_logged_in_client() {
    let store = Arc::new(MemoryStore::new());
    let (server, address) = start(store.clone());
    assert_eq!(server.broadcast_text("nobody home"), Delivery::NoRecipients);

    let mut first = Client::connect(address).unwrap();
    let mut second = Client::connect(address).unwrap();
    let mut anonymous = Client::connect(address).unwrap();
    let email = registered(&mut first, "drew");
    first.login(&email, "secret").unwrap();
    let email = registered(&mut second, "emery");
    second.login(&email, "secret").unwrap();

    assert_eq!(server.broadcast_text("maintenance at noon"), Delivery::Queued(2));

    for client in [&mut first, &mut second] {
        client.take_notices();
        let notice = client.recv(Duration::from_secs(2)).unwrap();
        assert_eq!(notice.kind(), &MessageKind::ServerMessage);
        assert_eq!(notice.text("message"), Some("maintenance at noon"));
    }

    anonymous.recv(Duration::from_secs(1)).unwrap();
    assert!(matches!(
        anonymous.recv(Duration::from_millis(300)),
        Err(ClientError::Timeout(_))
    ));

    let recipients = server.active_clients();
    for active in recipients {
        assert_eq!(
            store.messages_for(active.client_id),
            vec!["maintenance at noon".to_string()]
        );
    }
}

#[test]
fn direct_messages_arrive_in_order() {
    let (server, address) = start(Arc::new(MemoryStore::new()));
    let mut client = Client::connect(address).unwrap();
    let email = registered(&mut client, "finley");
    let login = client.login(&email, "secret").unwrap();
    let client_id = login
        .get("client_info")
        .and_then(Value::as_map)
        .and_then(|info| info.get("id"))
        .and_then(Value::as_int)
        .unwrap();
    client.take_notices();

    for n in 0..25 {
        assert_eq!(
            server.send_text_to(client_id, &format!("update {n}")),
            Delivery::Queued(1)
        );
    }

    for n in 0..25 {
        let notice = client.recv(Duration::from_secs(2)).unwrap();
        assert_eq!(notice.text("message"), Some(format!("update {n}").as_str()));
    }
}

#[test]
fn oversized_frame_closes_connection() {
    let (server, address) = start(Arc::new(MemoryStore::new()));
    let stream = TcpStream::connect(address).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut transport = ProtocolTransport::new(stream);

    assert!(matches!(
        transport.read_message().unwrap(),
        Received::Message(_)
    ));
    wait_until("connection to register", || server.connection_count() == 1);

    transport
        .get_mut()
        .write_all(&(1024 * 1024u32).to_be_bytes())
        .unwrap();

    match transport.read_message() {
        Ok(Received::Closed) | Err(_) => {}
        Ok(other) => panic!("connection should close, got {other:?}"),
    }
    wait_until("connection to be dropped", || server.connection_count() == 0);
}

/// One QUERY frame whose `nested` value wraps `Null` in `depth` one-element lists.
fn nested_query_frame(depth: usize) -> Vec<u8> {
    fn push_text(body: &mut Vec<u8>, text: &str) {
        body.extend_from_slice(&(text.len() as u64).to_be_bytes());
        body.extend_from_slice(text.as_bytes());
    }

    let mut body = Vec::new();
    push_text(&mut body, "QUERY");
    body.extend_from_slice(&1u64.to_be_bytes());
    push_text(&mut body, "nested");
    for _ in 0..depth {
        body.extend_from_slice(&6u32.to_be_bytes());
        body.extend_from_slice(&1u64.to_be_bytes());
    }
    body.extend_from_slice(&0u32.to_be_bytes());

    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    frame
}

#[test]
fn deeply_nested_frame_closes_only_its_connection() {
    let config = ServerConfig {
        max_message_size: 4 * 1024 * 1024,
        poll_interval_ms: 500,
        ..test_config()
    };
    let server = Server::new(config, Arc::new(MemoryStore::new()), Arc::new(catalog()));
    let address = server.start("127.0.0.1", 0).unwrap();

    let mut bystander = Client::connect(address).unwrap();
    let email = registered(&mut bystander, "jordan");
    bystander.login(&email, "secret").unwrap();

    let stream = TcpStream::connect(address).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut transport = ProtocolTransport::new(stream);
    assert!(matches!(
        transport.read_message().unwrap(),
        Received::Message(_)
    ));

    transport
        .get_mut()
        .write_all(&nested_query_frame(200_000))
        .unwrap();
    match transport.read_message() {
        Ok(Received::Closed) | Err(_) => {}
        Ok(other) => panic!("connection should close, got {other:?}"),
    }
    wait_until("nested connection to drop", || server.connection_count() == 1);

    assert!(server.is_running());
    let reply = bystander.query("echo", Payload::new()).unwrap();
    assert_eq!(reply.kind(), &MessageKind::QueryResult);

    let mut newcomer = Client::connect(address).unwrap();
    registered(&mut newcomer, "kai");
    server.stop();
}

#[test]
fn abrupt_disconnect_ends_session() {
    let store = Arc::new(MemoryStore::new());
    let (server, address) = start(store.clone());
    let mut client = Client::connect(address).unwrap();
    let email = registered(&mut client, "gray");
    client.login(&email, "secret").unwrap();
    assert_eq!(store.open_sessions().unwrap().len(), 1);

    drop(client);

    wait_until("session to end", || {
        store.open_sessions().map(|s| s.is_empty()).unwrap_or(false)
    });
    wait_until("registry to empty", || server.active_clients().is_empty());
    assert!(store.sessions()[0].end_time.is_some());
}

#[test]
fn stop_closes_clients_and_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let (server, address) = start(store.clone());
    let mut client = Client::connect(address).unwrap();
    let email = registered(&mut client, "harper");
    client.login(&email, "secret").unwrap();
    let mut idle = Client::connect(address).unwrap();
    wait_until("both connections", || server.connection_count() == 2);

    server.stop();
    server.stop();

    assert!(!server.is_running());
    assert!(server.active_clients().is_empty());
    assert_eq!(server.connection_count(), 0);
    assert!(store.open_sessions().unwrap().is_empty());

    assert_closed(&mut client);
    assert_closed(&mut idle);
}

#[test]
fn sqlite_backed_sessions() {
    let temp = TempDir::new("sift").unwrap();
    let store = Arc::new(
        SqliteStore::open(temp.path().join("sift.db"), 2, Duration::from_secs(1)).unwrap(),
    );
    let (server, address) = start(store.clone());

    let mut client = Client::connect(address).unwrap();
    let email = registered(&mut client, "indigo");
    let duplicate = client
        .register("indigo", "indigo", &email, "secret")
        .unwrap();
    assert_eq!(duplicate.kind(), &MessageKind::Error);

    assert!(client.login(&email, "secret").unwrap().is_ok());
    let reply = client.query("echo", Payload::new()).unwrap();
    let query_id = reply.get("query_id").and_then(Value::as_int).unwrap();

    let clients = server.all_clients().unwrap();
    assert_eq!(clients.len(), 1);
    let queries = server.client_queries(clients[0].id).unwrap();
    assert_eq!(queries[0].id, query_id);
    assert_eq!(server.active_sessions().unwrap().len(), 1);

    client.logout().unwrap();
    assert!(server.active_sessions().unwrap().is_empty());

    server.stop();
    assert!(store.pool().is_closed());
}
