use std::time::Duration;

use rib_live::client::session::{retry_delay, ConnState, ConnectionSession, Effect, Event, Page, ATTEMPT_RESET};
use rib_live::protocol::{ClientMessage, Replicated, ServerMessage, SyncAck, Update};

const THREAD: u64 = 5;

fn page() -> Page {
    Page { board: "a".into(), thread: THREAD }
}

fn ack(ctr: u64, replay: bool) -> Event {
    Event::Frame(ServerMessage::Synchronize(SyncAck { ctr, replay }).encode().unwrap())
}

fn entry(seq: u64) -> String {
    ServerMessage::Update(Replicated::new(seq, THREAD, Update::LockThread { locked: seq % 2 == 0 }))
        .encode()
        .unwrap()
}

fn synced() -> ConnectionSession {
    let mut s = ConnectionSession::new(page());
    s.handle(Event::Start);
    s.handle(Event::Opened);
    s.handle(ack(0, true));
    assert_eq!(s.state(), ConnState::Synced);
    s
}

#[test]
fn handshake_sends_last_seen_counter() {
    let mut s = ConnectionSession::new(page());
    assert_eq!(s.handle(Event::Start), vec![Effect::Status(ConnState::Connecting), Effect::OpenTransport]);
    let fx = s.handle(Event::Opened);
    assert_eq!(fx[0], Effect::Status(ConnState::Syncing));
    let Effect::Send(frame) = &fx[1] else { panic!("expected sync frame, got {fx:?}") };
    match ClientMessage::decode(frame).unwrap() {
        ClientMessage::Synchronize(req) => {
            assert_eq!(req.board, "a");
            assert_eq!(req.thread, THREAD);
            assert_eq!(req.ctr.get(&THREAD), Some(&0));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn inline_replay_completes_sync() {
    let mut s = ConnectionSession::new(page());
    s.handle(Event::Start);
    s.handle(Event::Opened);
    assert!(s.handle(ack(3, true)).is_empty());
    assert_eq!(s.state(), ConnState::Syncing);
    s.handle(Event::Frame(entry(1)));
    s.handle(Event::Frame(entry(2)));
    let fx = s.handle(Event::Frame(entry(3)));
    assert_eq!(fx, vec![Effect::Status(ConnState::Synced), Effect::ScheduleAttemptReset(ATTEMPT_RESET)]);
    assert_eq!(s.last_seq(), 3);
}

#[test]
fn ack_without_replay_fetches_the_backlog() {
    let mut s = ConnectionSession::new(page());
    s.handle(Event::Start);
    s.handle(Event::Opened);
    let fx = s.handle(ack(4, false));
    assert_eq!(fx, vec![Effect::FetchBacklog { generation: 0, thread: THREAD, start: 1, end: 5 }]);

    let frames = (1..=4).map(entry).collect();
    let fx = s.handle(Event::BacklogDone { generation: 0, result: Ok(frames) });
    assert_eq!(fx[0], Effect::Status(ConnState::Synced));
    assert_eq!(s.last_seq(), 4);
    assert!(s.model().locked);
}

#[test]
fn duplicates_are_skipped_and_gaps_fetched() {
    let mut s = synced();
    s.handle(Event::Frame(entry(1)));
    assert!(s.handle(Event::Frame(entry(1))).is_empty());
    assert_eq!(s.last_seq(), 1);

    let fx = s.handle(Event::Frame(entry(4)));
    assert_eq!(fx, vec![Effect::FetchBacklog { generation: 0, thread: THREAD, start: 2, end: 4 }]);
    // a second gapped entry while fetching is only buffered
    assert!(s.handle(Event::Frame(entry(5))).is_empty());
    assert_eq!(s.last_seq(), 1);

    s.handle(Event::BacklogDone { generation: 0, result: Ok(vec![entry(2), entry(3)]) });
    assert_eq!(s.last_seq(), 5);
    assert_eq!(s.state(), ConnState::Synced);
}

#[test]
fn stale_backlog_after_reconnect_is_ignored() {
    let mut s = synced();
    s.handle(Event::Frame(entry(1)));
    s.handle(Event::Frame(entry(3)));
    s.handle(Event::Closed);
    assert!(s.handle(Event::BacklogDone { generation: 0, result: Ok(vec![entry(2)]) }).is_empty());
    assert_eq!(s.last_seq(), 1);
}

#[test]
fn retry_backoff_grows_with_attempts() {
    let mut s = synced();
    let mut waits = Vec::new();
    for _ in 0..5 {
        let fx = s.handle(Event::Closed);
        assert_eq!(s.state(), ConnState::Dropped);
        assert_eq!(fx[0], Effect::CancelTimers);
        let Some(Effect::ScheduleRetry(wait)) = fx.last().cloned() else { panic!("no retry in {fx:?}") };
        waits.push(wait);
        assert_eq!(s.handle(Event::RetryTimer), vec![Effect::Status(ConnState::Reconnecting), Effect::OpenTransport]);
    }
    let ms: Vec<u128> = waits.iter().map(Duration::as_millis).collect();
    assert_eq!(ms, vec![500, 750, 750, 1125, 1125]);
    assert_eq!(s.attempts(), 5);
    assert_eq!(retry_delay(1000), retry_delay(24));
}

#[test]
fn attempts_reset_after_stable_sync_or_going_online() {
    let mut s = synced();
    s.handle(Event::Closed);
    s.handle(Event::Closed);
    assert_eq!(s.attempts(), 2);
    s.handle(Event::AttemptReset);
    assert_eq!(s.attempts(), 0);

    s.handle(Event::Closed);
    let fx = s.handle(Event::Online);
    assert_eq!(s.attempts(), 0);
    assert_eq!(fx, vec![Effect::CancelTimers, Effect::Status(ConnState::Reconnecting), Effect::OpenTransport]);
}

#[test]
fn invalid_message_is_terminal() {
    let mut s = synced();
    let fx = s.handle(Event::Frame(ServerMessage::Invalid("bad counter".into()).encode().unwrap()));
    assert_eq!(
        fx,
        vec![Effect::CancelTimers, Effect::CloseTransport, Effect::Status(ConnState::Desynced)]
    );
    assert_eq!(s.desync_reason(), Some("bad counter"));
    assert!(s.handle(Event::Closed).is_empty());
    assert!(s.handle(Event::RetryTimer).is_empty());
    assert!(s.handle(Event::Foreground { transport_alive: false }).is_empty());
    assert_eq!(s.state(), ConnState::Desynced);
}

#[test]
fn malformed_frame_desyncs() {
    let mut s = synced();
    s.handle(Event::Frame("02{not json".into()));
    assert_eq!(s.state(), ConnState::Desynced);

    // an update the model cannot apply also means divergence
    let mut s = synced();
    let orphan = ServerMessage::Update(Replicated::new(1, THREAD, Update::DeletePost { id: 77 })).encode().unwrap();
    s.handle(Event::Frame(orphan));
    assert_eq!(s.state(), ConnState::Desynced);
}

#[test]
fn foreground_pings_or_drops() {
    let mut s = synced();
    let fx = s.handle(Event::Foreground { transport_alive: true });
    assert_eq!(fx, vec![Effect::Send(ClientMessage::NoOp.encode().unwrap())]);

    let fx = s.handle(Event::Foreground { transport_alive: false });
    assert!(fx.contains(&Effect::CloseTransport));
    assert_eq!(s.state(), ConnState::Dropped);

    let fx = s.handle(Event::Foreground { transport_alive: false });
    assert!(fx.contains(&Effect::OpenTransport));
    assert_eq!(s.state(), ConnState::Reconnecting);
}

#[test]
fn offline_drops_the_connection() {
    let mut s = synced();
    let fx = s.handle(Event::Offline);
    assert!(fx.contains(&Effect::CloseTransport));
    assert_eq!(s.state(), ConnState::Dropped);
    assert!(s.handle(Event::Offline).is_empty());
}

#[test]
fn navigate_tears_down_and_reconnects() {
    let mut s = synced();
    s.handle(Event::Frame(entry(1)));
    s.handle(Event::Frame(entry(3)));
    let fx = s.handle(Event::Navigate(Page { board: "b".into(), thread: 9 }));
    assert_eq!(
        fx,
        vec![
            Effect::CancelTimers,
            Effect::CloseTransport,
            Effect::Status(ConnState::Connecting),
            Effect::OpenTransport
        ]
    );
    assert_eq!(s.last_seq(), 0);
    assert!(s.model().is_empty());
    // the fetch started for the old thread is now stale
    assert!(s.handle(Event::BacklogDone { generation: 0, result: Ok(vec![]) }).is_empty());
}

#[test]
fn redirect_follows_to_the_thread() {
    let mut s = ConnectionSession::new(Page { board: "a".into(), thread: 6 });
    s.handle(Event::Start);
    s.handle(Event::Opened);
    let redirect = r#"37{"board":"a","thread":5,"id":6}"#;
    let fx = s.handle(Event::Frame(redirect.into()));
    assert!(fx.contains(&Effect::OpenTransport));
    assert_eq!(s.page(), &page());
}

#[test]
fn control_messages_update_session_fields() {
    let mut s = synced();
    let frames = [
        ServerMessage::SyncCount(3),
        ServerMessage::ServerTime(1_700_000_000_000),
        ServerMessage::PostId(42),
        ServerMessage::Reclaim(0),
        ServerMessage::Notification("hi".into()),
        ServerMessage::reject(rib_live::protocol::MessageType::InsertPost, "too long"),
    ];
    let concat = ServerMessage::Concat(frames.to_vec()).encode().unwrap();
    assert!(s.handle(Event::Frame(concat)).is_empty());
    assert_eq!(s.online, 3);
    assert_eq!(s.server_time, Some(1_700_000_000_000));
    assert_eq!(s.assigned_id, Some(42));
    assert_eq!(s.reclaimed, Some(true));
    assert_eq!(s.notifications, vec!["hi".to_string()]);
    assert_eq!(s.rejections[0].error, "too long");
}

#[test]
fn backlog_failure_drops_for_a_retry() {
    let mut s = ConnectionSession::new(page());
    s.handle(Event::Start);
    s.handle(Event::Opened);
    s.handle(ack(4, false));
    let fx = s.handle(Event::BacklogDone { generation: 0, result: Err("503".into()) });
    assert_eq!(s.state(), ConnState::Dropped);
    assert!(matches!(fx.last(), Some(Effect::ScheduleRetry(_))));
}
