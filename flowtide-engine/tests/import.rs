mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use flowtide_capture::MemorySource;
use flowtide_config::CaptureConfig;
use flowtide_core::events::{BroadcastNotifier, Notification};
use flowtide_core::flow::{Direction, FlowKey};
use flowtide_core::reassembly::{CloseReason, FlowState};
use flowtide_core::record::{ConnectionRecord, StreamChunk};
use flowtide_engine::{AppContext, EngineError, ErrorScope, SessionHandle, SessionManager, SessionState, SessionStatus};
use flowtide_storage::{documents, stream_chunks, Collection, ConnectionQuery, MatchQuery, MemoryStorage, Storage};

async fn records(storage: &dyn Storage, capture_id: &str) -> Vec<ConnectionRecord> {
    ConnectionQuery::new().capture(capture_id).run(storage).await.unwrap()
}

fn by_port(records: &[ConnectionRecord], port: u16) -> &ConnectionRecord {
    records
        .iter()
        .find(|r| r.key.server_port == port)
        .unwrap_or_else(|| panic!("no record for port {port}"))
}

async fn wait_for_frames(handle: &SessionHandle, frames: u64) {
    for _ in 0..500 {
        if handle.status().frames_read >= frames {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never read {frames} frames");
}

/// An HTTP exchange without a flag and an SSH banner carrying one.
fn web_and_ssh() -> Capture {
    let mut capture = Capture::new();
    let mut http = Conversation::new("10.0.0.1:1234", "10.10.0.5:80");
    let mut ssh = Conversation::new("10.0.0.2:5555", "10.10.0.6:22");

    http.handshake(&mut capture)
        .client_sends(&mut capture, b"GET / HTTP/1.1\r\nHost: web\r\n\r\n");
    ssh.handshake(&mut capture)
        .server_sends(&mut capture, b"SSH-2.0-OpenSSH_9.6 FLAG{deadbeef}\r\n");
    http.server_sends(&mut capture, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .close(&mut capture);
    ssh.client_sends(&mut capture, b"SSH-2.0-client\r\n").close(&mut capture);
    capture
}

#[tokio::test]
async fn flag_is_found_in_the_ssh_banner_only() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;

    let handle = manager.start_import(web_and_ssh().source("web-ssh")).unwrap();
    let status = handle.wait().await.unwrap();

    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.flows.opened, 2);
    assert_eq!(status.flows.closed, 2);
    assert_eq!(status.flows.open, 0);
    assert_eq!(status.matches, 1);
    assert!(status.errors.is_empty(), "{:?}", status.errors);

    let all = records(storage.as_ref(), "web-ssh").await;
    assert_eq!(all.len(), 2);

    let http = by_port(&all, 80);
    assert_eq!(http.service.as_deref(), Some("http"));
    assert!(http.match_ids.is_empty());
    assert_eq!(http.state, FlowState::Closed);
    assert_eq!(http.close_reason, Some(CloseReason::Fin));
    assert!(http.finalized);
    assert_eq!(http.key.client_port, 1234);

    let ssh = by_port(&all, 22);
    assert_eq!(ssh.service.as_deref(), Some("ssh"));
    assert_eq!(ssh.match_ids.len(), 1);
    assert_eq!(ssh.rule_ids, ["flag"]);

    let matches = MatchQuery::new().connection(&ssh.id).run(storage.as_ref()).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].rule_id, "flag");
    assert_eq!(matches[0].matched_text, "FLAG{deadbeef}");
    assert_eq!(matches[0].direction, Direction::ServerToClient);
    assert_eq!(matches[0].offset, 20);
    assert_eq!(matches[0].id, ssh.match_ids[0]);
}

#[tokio::test]
async fn delivered_bytes_are_stored_per_direction() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;
    let status = manager
        .start_import(web_and_ssh().source("streams"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(status.state, SessionState::Completed);

    let all = records(storage.as_ref(), "streams").await;
    let http = by_port(&all, 80);
    let chunks = stream_chunks(storage.as_ref(), &http.id).await.unwrap();

    let collect = |direction: Direction| -> Vec<u8> {
        chunks
            .iter()
            .filter(|c| c.direction == direction)
            .flat_map(|c| c.payload().unwrap())
            .collect()
    };
    assert_eq!(collect(Direction::ClientToServer), b"GET / HTTP/1.1\r\nHost: web\r\n\r\n");
    assert_eq!(
        collect(Direction::ServerToClient),
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
    );
    assert_eq!(http.client_to_server.bytes, 29);
}

#[tokio::test]
async fn importing_the_same_capture_twice_is_idempotent() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;
    let capture = web_and_ssh();

    manager.start_import(capture.source("twice")).unwrap().wait().await.unwrap();
    let first = records(storage.as_ref(), "twice").await;
    let counts = |s: &MemoryStorage| {
        [Collection::Connections, Collection::Matches, Collection::ConnectionStreams].map(|c| s.count(c))
    };
    let before = counts(&storage);

    manager.start_import(capture.source("twice")).unwrap().wait().await.unwrap();
    let second = records(storage.as_ref(), "twice").await;

    assert_eq!(counts(&storage), before);
    let ids = |rs: &[ConnectionRecord]| rs.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(storage.count(Collection::Sessions), 2);
}

#[tokio::test]
async fn overflowing_hold_window_corrupts_only_that_flow() {
    let mut config = base_config();
    config.reassembly.max_held_segments = 2;
    let storage = Arc::new(MemoryStorage::new());
    let manager = SessionManager::new(configured_app(config, storage.clone()).await);

    let mut capture = Capture::new();
    let mut lossy = Conversation::new("10.0.0.1:40000", "10.10.0.5:8080");
    let mut clean = Conversation::new("10.0.0.2:40001", "10.10.0.6:80");
    lossy.handshake(&mut capture).client_sends(&mut capture, b"head");
    clean.handshake(&mut capture).client_sends(&mut capture, b"GET /");
    lossy.client_loses(100);
    for part in [&b"one"[..], b"two", b"three"] {
        lossy.client_sends(&mut capture, part);
    }
    lossy.close(&mut capture);
    clean.close(&mut capture);

    let status = manager
        .start_import(capture.source("lossy"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.flows.corrupted, 1);
    assert_eq!(status.flows.closed, 1);

    let all = records(storage.as_ref(), "lossy").await;
    let lossy = by_port(&all, 8080);
    assert_eq!(lossy.state, FlowState::Corrupted);
    assert_eq!(lossy.gaps.len(), 1);
    assert_eq!(lossy.gaps[0].offset, 4);
    assert_eq!(lossy.gaps[0].length, 100);
    assert_eq!(lossy.close_reason, Some(CloseReason::Fin));
    assert_eq!(by_port(&all, 80).state, FlowState::Closed);

    let corrupted = ConnectionQuery::new()
        .capture("lossy")
        .state(FlowState::Corrupted)
        .run(storage.as_ref())
        .await
        .unwrap();
    assert_eq!(corrupted.len(), 1);
}

#[tokio::test]
async fn failed_final_write_only_affects_its_flow() {
    let storage = Arc::new(FaultyStorage::failing_port(22));
    let manager = manager(storage.clone()).await;

    let status = manager
        .start_import(web_and_ssh().source("faulty"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.flows.persistence_failed, 1);
    assert_eq!(status.flows.closed, 2);
    let flow_errors: Vec<_> = status.flow_errors().collect();
    assert_eq!(flow_errors.len(), 1);
    assert!(matches!(flow_errors[0].scope, ErrorScope::Flow(_)));
    // One attempt plus the configured retries.
    assert_eq!(storage.rejected.load(Ordering::SeqCst), 4);

    let all = records(&storage.inner, "faulty").await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].key.server_port, 80);
    assert!(all[0].finalized);
}

/// Concatenates one direction of a stored stream, checking it has no holes.
fn contiguous(chunks: &[StreamChunk], direction: Direction) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunks.iter().filter(|c| c.direction == direction) {
        assert_eq!(chunk.offset, out.len() as u64, "chunk {} leaves a hole", chunk.index);
        out.extend(chunk.payload().unwrap());
    }
    out
}

#[tokio::test]
async fn unwritten_checkpoint_is_completed_by_the_final_write() {
    let mut config = base_config();
    config.session.partial_flush_secs = 1;
    // Every attempt the checkpoint makes at its match fails.
    let attempts = config.persistence.max_retries as usize + 1;
    let storage = Arc::new(FaultyStorage::failing_matches(attempts));
    let manager = SessionManager::new(configured_app(config, storage.clone()).await);

    // Long enough past the flag for the match to be settled on arrival.
    let mut banner = b"SSH-2.0-x FLAG{deadbeef}".to_vec();
    banner.resize(banner.len() + 600, b' ');
    let mut capture = Capture::new();
    let mut ssh = Conversation::new("10.0.0.2:5555", "10.10.0.6:22");
    ssh.handshake(&mut capture).server_sends(&mut capture, &banner);
    capture.advance(Duration::from_secs(2));
    ssh.client_sends(&mut capture, b"SSH-2.0-client\r\n").close(&mut capture);

    let status = manager
        .start_import(capture.source("deferred"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.matches, 1);
    assert_eq!(status.flows.persistence_failed, 0);
    assert_eq!(status.flow_errors().count(), 1);
    assert_eq!(storage.rejected.load(Ordering::SeqCst), attempts);

    let all = records(&storage.inner, "deferred").await;
    assert_eq!(all.len(), 1);
    let record = &all[0];
    assert!(record.finalized);
    assert!(!record.persistence_failed);
    assert_eq!(record.match_ids.len(), 1);

    let stored = MatchQuery::new().connection(&record.id).run(&storage.inner).await.unwrap();
    let stored_ids: Vec<_> = stored.iter().map(|m| m.id.clone()).collect();
    assert_eq!(stored_ids, record.match_ids);
    assert_eq!(stored[0].offset, 10);

    let chunks = stream_chunks(&storage.inner, &record.id).await.unwrap();
    assert_eq!(contiguous(&chunks, Direction::ServerToClient), banner);
    assert_eq!(contiguous(&chunks, Direction::ClientToServer), b"SSH-2.0-client\r\n");
}

#[tokio::test]
async fn long_lived_flow_checkpoints_into_one_final_record() {
    let mut config = base_config();
    config.session.partial_flush_secs = 1;
    let storage = Arc::new(MemoryStorage::new());
    let manager = SessionManager::new(configured_app(config, storage.clone()).await);

    let mut capture = Capture::new();
    let mut shell = Conversation::new("10.0.0.1:40000", "10.10.0.5:4444");
    shell.handshake(&mut capture);
    let (mut typed, mut echoed) = (Vec::new(), Vec::new());
    for round in 0..5 {
        let command = format!("echo {round}\n");
        let reply = format!("{round}\n");
        shell
            .client_sends(&mut capture, command.as_bytes())
            .server_sends(&mut capture, reply.as_bytes());
        typed.extend_from_slice(command.as_bytes());
        echoed.extend_from_slice(reply.as_bytes());
        capture.advance(Duration::from_millis(1_500));
    }
    shell.close(&mut capture);

    let status = manager
        .start_import(capture.source("long-lived"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(status.state, SessionState::Completed);
    assert!(status.errors.is_empty(), "{:?}", status.errors);

    assert_eq!(storage.count(Collection::Connections), 1);
    let all = records(storage.as_ref(), "long-lived").await;
    let record = &all[0];
    assert!(record.finalized);
    assert_eq!(record.state, FlowState::Closed);
    assert_eq!(record.close_reason, Some(CloseReason::Fin));
    assert_eq!(record.client_to_server.bytes, typed.len() as u64);

    let chunks = stream_chunks(storage.as_ref(), &record.id).await.unwrap();
    let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, (0..chunks.len() as u64).collect::<Vec<_>>());
    assert_eq!(contiguous(&chunks, Direction::ClientToServer), typed);
    assert_eq!(contiguous(&chunks, Direction::ServerToClient), echoed);
}

#[tokio::test]
async fn cancellation_finalizes_open_flows() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;

    let mut capture = Capture::new();
    let mut flow = Conversation::new("10.0.0.1:40000", "10.10.0.5:80");
    flow.handshake(&mut capture).client_sends(&mut capture, b"GET /");
    flow.server_sends(&mut capture, b"HTTP/1.1 200 OK\r\n\r\n").close(&mut capture);

    let (source, release) = GatedSource::new(capture.source("cancelled"), 4);
    let handle = manager.start_import(source).unwrap();
    wait_for_frames(&handle, 4).await;
    manager.cancel(handle.id()).unwrap();
    let _ = release.send(());

    let status = handle.wait().await.unwrap();
    assert_eq!(status.state, SessionState::Cancelled);
    assert_eq!(status.frames_read, 4);
    assert_eq!(status.flows.open, 0);

    let all = records(storage.as_ref(), "cancelled").await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].close_reason, Some(CloseReason::Cancelled));
    assert!(all[0].finalized);
    assert_eq!(all[0].client_to_server.bytes, 5);
}

#[tokio::test]
async fn source_failure_aborts_but_keeps_finished_flows() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;

    let mut capture = Capture::new();
    let mut done = Conversation::new("10.0.0.1:40000", "10.10.0.5:80");
    let mut open = Conversation::new("10.0.0.2:40001", "10.10.0.6:22");
    done.handshake(&mut capture).client_sends(&mut capture, b"GET /").close(&mut capture);
    open.handshake(&mut capture).server_sends(&mut capture, b"SSH-2.0-x\r\n");
    let served = capture.len() as u64;
    open.client_sends(&mut capture, b"never read");

    let source = capture.source("truncated").fail_after(served, "truncated record");
    let status = manager.start_import(source).unwrap().wait().await.unwrap();

    assert_eq!(status.state, SessionState::Aborted);
    assert_eq!(status.frames_read, served);
    assert!(status
        .errors
        .iter()
        .any(|e| e.scope == ErrorScope::Session && e.message.contains("truncated record")));

    let all = records(storage.as_ref(), "truncated").await;
    assert_eq!(all.len(), 2);
    assert_eq!(by_port(&all, 80).close_reason, Some(CloseReason::Fin));
    let interrupted = by_port(&all, 22);
    assert_eq!(interrupted.close_reason, Some(CloseReason::SourceError));
    assert!(interrupted.finalized);
}

#[tokio::test]
async fn reused_tuple_after_close_is_a_new_connection() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;

    let mut capture = Capture::new();
    let mut first = Conversation::new("10.0.0.1:40000", "10.10.0.5:80");
    first.handshake(&mut capture).client_sends(&mut capture, b"first").close(&mut capture);
    let mut second = Conversation::new("10.0.0.1:40000", "10.10.0.5:80").with_isn(90_000, 7_000);
    second.handshake(&mut capture).client_sends(&mut capture, b"second").close(&mut capture);

    let status = manager.start_import(capture.source("reuse")).unwrap().wait().await.unwrap();
    assert_eq!(status.flows.opened, 2);

    let key = FlowKey::tcp(first.client, first.server);
    let mut both = ConnectionQuery::new().flow(&key).run(storage.as_ref()).await.unwrap();
    both.sort_by_key(|r| r.started_at_ns);
    assert_eq!(both.len(), 2);
    assert_ne!(both[0].id, both[1].id);
    assert_eq!(both[0].client_to_server.bytes, 5);
    assert_eq!(both[1].client_to_server.bytes, 6);
    assert!(both.iter().all(|r| r.close_reason == Some(CloseReason::Fin)));
}

#[tokio::test]
async fn idle_flows_are_closed_on_capture_time() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;

    let mut capture = Capture::new();
    let mut stale = Conversation::new("10.0.0.1:40000", "10.10.0.5:80");
    stale.handshake(&mut capture).client_sends(&mut capture, b"GET /");
    capture.advance(Duration::from_secs(300));
    let mut later = Conversation::new("10.0.0.2:40001", "10.10.0.6:22");
    later.handshake(&mut capture).client_sends(&mut capture, b"hi").close(&mut capture);

    manager.start_import(capture.source("idle")).unwrap().wait().await.unwrap();

    let all = records(storage.as_ref(), "idle").await;
    assert_eq!(by_port(&all, 80).close_reason, Some(CloseReason::IdleTimeout));
    assert_eq!(by_port(&all, 22).close_reason, Some(CloseReason::Fin));
}

#[tokio::test]
async fn non_tcp_frames_are_counted_and_skipped() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;

    let mut capture = Capture::new();
    capture.udp(([10, 0, 0, 1], 5353), ([10, 10, 0, 53], 53), b"query");
    let mut flow = Conversation::new("10.0.0.1:40000", "10.10.0.5:80");
    flow.handshake(&mut capture).client_sends(&mut capture, b"GET /");
    capture.udp(([10, 10, 0, 53], 53), ([10, 0, 0, 1], 5353), b"answer");
    capture.push(vec![0xff; 9]);
    flow.close(&mut capture);

    let total = capture.len() as u64;
    let status = manager.start_import(capture.source("mixed")).unwrap().wait().await.unwrap();

    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.frames_read, total);
    assert_eq!(status.frames_skipped, 2);
    assert_eq!(status.frames_malformed, 1);
    assert_eq!(status.frames_decoded, total - 3);
    assert_eq!(records(storage.as_ref(), "mixed").await.len(), 1);
}

#[tokio::test]
async fn capture_files_are_imported_through_the_manager() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("round.pcap");
    web_and_ssh().write_pcap(&path);

    let handle = manager.start_file_import(&path).await.unwrap();
    assert_eq!(handle.capture_id().len(), 64);
    let status = manager.wait(handle.id()).await.unwrap();

    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.matches, 1);
    assert_eq!(records(storage.as_ref(), handle.capture_id()).await.len(), 2);
    assert!(matches!(
        manager.start_file_import(dir.path().join("missing.pcap")).await,
        Err(EngineError::Capture(_))
    ));
}

#[tokio::test]
async fn concurrent_import_of_one_capture_is_rejected() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage.clone()).await;
    let capture = web_and_ssh();

    let (gated, release) = GatedSource::new(capture.source("busy"), 0);
    let running = manager.start_import(gated).unwrap();
    assert!(matches!(
        manager.start_import(capture.source("busy")),
        Err(EngineError::AlreadyImporting(id)) if id == "busy"
    ));
    assert!(manager.start_import(capture.source("other")).is_ok());

    let _ = release.send(());
    running.wait().await.unwrap();
    let again = manager.start_import(capture.source("busy")).unwrap();
    again.wait().await.unwrap();

    assert_eq!(manager.list().len(), 3);
    assert_eq!(
        manager.status(running.id()).unwrap().state,
        SessionState::Completed
    );
}

#[tokio::test]
async fn finished_sessions_beyond_retention_are_forgotten() {
    let mut config = base_config();
    config.session.retained_sessions = 1;
    let storage = Arc::new(MemoryStorage::new());
    let manager = SessionManager::new(configured_app(config, storage.clone()).await);

    let mut ids = Vec::new();
    for capture_id in ["first", "second", "third"] {
        let handle = manager.start_import(Capture::new().source(capture_id)).unwrap();
        handle.wait().await.unwrap();
        ids.push(handle.id().to_string());
    }

    assert!(matches!(manager.status(&ids[0]), Err(EngineError::UnknownSession(_))));
    assert!(manager.status(&ids[1]).is_ok());
    let listed: Vec<String> = manager.list().into_iter().map(|s| s.session_id).collect();
    assert_eq!(listed, &ids[1..]);
    assert_eq!(storage.count(Collection::Sessions), 3);
}

#[tokio::test]
async fn manager_requires_configuration_and_known_sessions() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let app = AppContext::new(base_config(), storage, Arc::new(BroadcastNotifier::new(8))).unwrap();
    let manager = SessionManager::new(Arc::new(app));

    assert!(matches!(
        manager.start_import(MemorySource::new("x", flowtide_capture::LinkType::Ethernet)),
        Err(EngineError::NotConfigured)
    ));
    assert!(matches!(manager.status("nope"), Err(EngineError::UnknownSession(_))));
    assert!(matches!(manager.cancel("nope"), Err(EngineError::UnknownSession(_))));

    manager
        .app()
        .configure(CaptureConfig::new(SERVER_NET, FLAG))
        .await
        .unwrap();
    let status = manager
        .start_import(MemorySource::new("empty", flowtide_capture::LinkType::Ethernet))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.frames_read, 0);
}

#[tokio::test]
async fn subscribers_see_matches_closes_and_the_session_end() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let notifier = Arc::new(BroadcastNotifier::new(256));
    let mut events = notifier.subscribe();
    let app = AppContext::new(base_config(), storage.clone(), notifier).unwrap();
    app.configure(CaptureConfig::new(SERVER_NET, FLAG)).await.unwrap();
    let manager = SessionManager::new(Arc::new(app));

    let handle = manager.start_import(web_and_ssh().source("notify")).unwrap();
    handle.wait().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Notification::SessionFinished { session_id, status } = &event {
            assert_eq!(session_id, handle.id());
            assert_eq!(status, "completed");
        }
        kinds.push(event.kind());
    }
    assert_eq!(kinds.iter().filter(|k| **k == "rule_matched").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "connection_finalized").count(), 2);
    assert_eq!(kinds.last(), Some(&"session_finished"));

    let summary: SessionStatus = documents::get(storage.as_ref(), Collection::Sessions, handle.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.state, SessionState::Completed);
    assert!(summary.finished_at.is_some());
}
