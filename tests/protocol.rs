#![cfg(feature = "inmem-store")]

mod common;

use common::harness;
use rib_live::models::{Command, DiceRoll, Identity, Link, Segment};
use rib_live::protocol::{NewPost, Replicated, ServerMessage, Update};

#[tokio::test]
async fn logged_insert_decodes_to_the_stored_body() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let req = NewPost { body: format!("see >>{thread} then #flip and \"quotes\" ü\n"), ..Default::default() };
    let inserted = h
        .services
        .writer
        .insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, req, |_| {})
        .await
        .unwrap();

    let body = &inserted.post.body;
    assert!(body.iter().any(|s| matches!(s, Segment::Link { link } if link.id == thread)));
    assert!(body.iter().any(|s| matches!(s, Segment::Command { command: Command::Flip(_) })));

    let entries = h.services.store.read_log(thread, 2, 3).await.unwrap();
    let rep = match ServerMessage::decode(&entries[0].payload).unwrap() {
        ServerMessage::Update(rep) => rep,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(rep.seq, 2);
    assert_eq!(rep.update, Update::InsertPost(inserted.post.clone()));
    let stored = h.services.store.get_post(inserted.post.id).await.unwrap();
    assert_eq!(&stored.post.body, body);
}

#[tokio::test]
async fn text_runs_survive_the_wire_byte_for_byte() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let mut post = h
        .services
        .writer
        .insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, NewPost { body: "x".into(), ..Default::default() }, |_| {})
        .await
        .unwrap()
        .post;
    post.body = vec![
        Segment::Text("  leading space, tab\t, nul \u{0} and emoji 🎲 ".into()),
        Segment::Link { link: Link { id: 9, thread: 8, board: "b".into() } },
        Segment::Text(">>not a link".into()),
        Segment::Command { command: Command::Dice(DiceRoll { count: 2, faces: 6, bias: -1, rolls: vec![3, 5] }) },
        Segment::Command { command: Command::EightBall("Outlook good".into()) },
        Segment::Text(String::new()),
    ];

    let frame = Replicated::new(7, thread, Update::InsertPost(post.clone())).encode().unwrap();
    assert!(!frame.contains('\u{0}'));
    match ServerMessage::decode(&frame).unwrap() {
        ServerMessage::Update(rep) => {
            assert_eq!((rep.seq, rep.thread), (7, thread));
            match rep.update {
                Update::InsertPost(back) => assert_eq!(back.body, post.body),
                other => panic!("unexpected {other:?}"),
            }
        }
        other => panic!("unexpected {other:?}"),
    }
}
