mod common;

use axum::extract::ws::Message;
use common::{build, config, harness, spec, Harness};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use nimbus_common::ErrorKind;
use nimbus_daemon::ssh::simulated::SimulatedConnector;
use nimbus_daemon::terminal::bridge;
use nimbus_provider::SimulatedProvider;
use std::time::Duration;

type ClientTx = mpsc::UnboundedSender<Result<Message, std::io::Error>>;
type ClientRx = mpsc::UnboundedReceiver<Message>;

/// Open a session for `user` and serve it over in-memory channels
async fn connect(h: &Harness, instance_id: &str, user: &str) -> (String, ClientTx, ClientRx, tokio::task::JoinHandle<()>) {
    let terminals = h.daemon.terminals().clone();
    let record = terminals.open_session(instance_id, user).unwrap();
    let session = terminals.authorize(&record.id, user).unwrap();

    let (client_tx, server_rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
    let (server_tx, client_rx) = mpsc::unbounded::<Message>();
    let task = tokio::spawn(async move {
        bridge::serve(&terminals, session, server_tx, server_rx).await;
    });
    (record.id, client_tx, client_rx, task)
}

fn text(msg: Option<Message>) -> String {
    match msg {
        Some(Message::Text(t)) => t,
        other => panic!("expected text frame, got {:?}", other),
    }
}

fn binary(msg: Option<Message>) -> Vec<u8> {
    match msg {
        Some(Message::Binary(b)) => b,
        other => panic!("expected binary frame, got {:?}", other),
    }
}

#[tokio::test]
async fn bridge_relays_input_output_and_resize() {
    let h = harness();
    let instance = h.running("shell").await;
    let (session_id, mut tx, mut rx, task) = connect(&h, &instance.id, "alice").await;

    assert_eq!(text(rx.next().await), r#"{"type":"ready"}"#);
    assert_eq!(binary(rx.next().await), b"$ ");
    assert_eq!(h.ssh.open_ptys(), 1);

    tx.send(Ok(Message::Text(r#"{"type":"data","payload":"ls\n"}"#.into())))
        .await
        .unwrap();
    assert_eq!(binary(rx.next().await), b"ls\n");

    tx.send(Ok(Message::Binary(b"pwd\n".to_vec()))).await.unwrap();
    assert_eq!(binary(rx.next().await), b"pwd\n");

    // Ignored frames do not break the stream
    tx.send(Ok(Message::Text("garbage".into()))).await.unwrap();
    tx.send(Ok(Message::Text(r#"{"type":"resize","cols":120,"rows":40}"#.into())))
        .await
        .unwrap();
    tx.send(Ok(Message::Text(r#"{"type":"data","payload":"exit\n"}"#.into())))
        .await
        .unwrap();
    assert_eq!(binary(rx.next().await), b"exit\n");

    assert_eq!(text(rx.next().await), r#"{"type":"exit"}"#);
    assert!(matches!(rx.next().await, Some(Message::Close(None))));
    task.await.unwrap();

    assert_eq!(h.ssh.pty_sizes(), vec![(80, 24), (120, 40)]);
    assert_eq!(h.ssh.open_ptys(), 0);
    assert_eq!(h.daemon.terminals().session_count(), 0);
    assert!(h
        .daemon
        .terminals()
        .authorize(&session_id, "alice")
        .unwrap_err()
        .is_not_found());
    assert!(h.daemon.state().list_sessions().unwrap().is_empty());
}

#[tokio::test]
async fn closing_the_session_ends_the_bridge() {
    let h = harness();
    let instance = h.running("shell").await;
    let (session_id, _tx, mut rx, task) = connect(&h, &instance.id, "alice").await;

    assert_eq!(text(rx.next().await), r#"{"type":"ready"}"#);
    assert_eq!(binary(rx.next().await), b"$ ");

    h.daemon.terminals().close_owned(&session_id, "alice").unwrap();
    assert_eq!(text(rx.next().await), r#"{"type":"exit"}"#);
    task.await.unwrap();

    for _ in 0..100 {
        if h.ssh.open_ptys() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.ssh.open_ptys(), 0);
}

#[tokio::test]
async fn client_hangup_releases_the_pty() {
    let h = harness();
    let instance = h.running("shell").await;
    let (_, tx, mut rx, task) = connect(&h, &instance.id, "alice").await;

    assert_eq!(text(rx.next().await), r#"{"type":"ready"}"#);
    drop(tx);
    task.await.unwrap();
    assert_eq!(h.daemon.terminals().session_count(), 0);
}

#[tokio::test]
async fn attach_failure_reports_error_frame() {
    let h = harness();
    let instance = h.running("shell").await;
    let terminals = h.daemon.terminals().clone();
    let record = terminals.open_session(&instance.id, "alice").unwrap();
    let session = terminals.authorize(&record.id, "alice").unwrap();

    h.daemon.vps().delete_vps(&instance.id).await.unwrap();

    let (_client_tx, server_rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
    let (server_tx, mut rx) = mpsc::unbounded::<Message>();
    bridge::serve(&terminals, session, server_tx, server_rx).await;

    let frame = text(rx.next().await);
    assert!(frame.starts_with(r#"{"type":"error""#), "{}", frame);
    assert_eq!(text(rx.next().await), r#"{"type":"exit"}"#);
    assert_eq!(terminals.session_count(), 0);
}

#[tokio::test]
async fn session_attaches_once() {
    let h = harness();
    let instance = h.running("shell").await;
    let terminals = h.daemon.terminals();
    let record = terminals.open_session(&instance.id, "alice").unwrap();
    let session = terminals.authorize(&record.id, "alice").unwrap();

    let _pty = terminals.attach(&session).await.unwrap();
    assert!(session.is_attached());
    let err = terminals.attach(&session).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn sessions_belong_to_their_creator() {
    let h = harness();
    let instance = h.running("shell").await;
    let terminals = h.daemon.terminals();

    let record = terminals.open_session(&instance.id, "alice").unwrap();
    assert_eq!(record.id.len(), 64);
    assert_eq!(h.daemon.state().list_sessions().unwrap(), vec![record.clone()]);

    let err = terminals.authorize(&record.id, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    let err = terminals.close_owned(&record.id, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(terminals.session_count(), 1);

    assert_eq!(terminals.list_for("alice").len(), 1);
    assert!(terminals.list_for("bob").is_empty());

    let err = terminals.authorize("missing", "alice").unwrap_err();
    assert!(err.is_not_found());
    let err = terminals.open_session(&instance.id, "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = terminals.open_session("missing", "alice").unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_expire() {
    let h = harness();
    let instance = h.running("shell").await;
    let terminals = h.daemon.terminals();

    let idle = terminals.open_session(&instance.id, "alice").unwrap();
    let active = terminals.open_session(&instance.id, "alice").unwrap();

    tokio::time::advance(Duration::from_secs(1000)).await;
    terminals.authorize(&active.id, "alice").unwrap().touch();
    tokio::time::advance(Duration::from_secs(900)).await;

    assert_eq!(terminals.sweep_idle(), 1);
    assert!(terminals.authorize(&idle.id, "alice").is_err());
    assert!(terminals.authorize(&active.id, "alice").is_ok());
}

#[tokio::test(start_paused = true)]
async fn sweeper_runs_until_shutdown() {
    let mut config = config();
    config.terminal.idle_timeout_secs = 60;
    config.terminal.sweep_interval_secs = 10;
    let h = build(
        SimulatedProvider::new().with_readiness_delay(Duration::ZERO),
        SimulatedConnector::new(),
        config,
    );
    let instance = h.running("shell").await;
    let terminals = h.daemon.terminals().clone();
    terminals.open_session(&instance.id, "alice").unwrap();

    let token = h.daemon.shutdown_token();
    let sweeper = {
        let terminals = terminals.clone();
        let token = token.clone();
        tokio::spawn(async move { terminals.run_sweeper(token).await })
    };

    tokio::time::sleep(Duration::from_secs(75)).await;
    assert_eq!(terminals.session_count(), 0);

    token.cancel();
    sweeper.await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let h = harness();
    let instance = h.running("shell").await;
    let terminals = h.daemon.terminals();

    let a = terminals.open_session(&instance.id, "alice").unwrap();
    terminals.open_session(&instance.id, "bob").unwrap();
    let session = terminals.authorize(&a.id, "alice").unwrap();

    h.daemon.shutdown().await;
    assert_eq!(terminals.session_count(), 0);
    assert!(session.is_closed());
    assert!(h.daemon.state().list_sessions().unwrap().is_empty());
    assert_eq!(h.daemon.ssh().cached_count(), 0);
}

#[tokio::test]
async fn sessions_require_a_reachable_instance() {
    let h = harness();
    let mut spec = spec("pending");
    spec.domain = Some("pending.example.org".to_string());
    // The unknown zone fails domain setup after SSH was reachable
    let handle = h.daemon.vps().create_vps(spec).await.unwrap();
    let id = handle.id.clone();
    assert!(handle.wait().await.is_err());

    let err = h.daemon.terminals().open_session(&id, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}
