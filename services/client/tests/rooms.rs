mod common;

use common::{Harness, PROJECT, accept, ack, config, expect, push, within};
use serde_json::{Value, json};
use sitegen_client::ws::protocol::{CursorPosition, Envelope, events};

#[tokio::test]
async fn test_join_twice_then_leave_sends_one_of_each() {
    let mut harness = Harness::new(config());
    let mut link = harness.login().await;
    let rooms = harness.studio.rooms().clone();

    let (joined, _) = within(async {
        tokio::join!(rooms.join_room(PROJECT), async {
            let join = expect(&mut link, events::JOIN_ROOM).await;
            ack(&link, &join, Value::Null).await;
        })
    })
    .await;
    joined.unwrap();

    // Already joined: answered locally.
    rooms.join_room(PROJECT).await.unwrap();

    let (left, frame) = within(async {
        tokio::join!(rooms.leave_room(PROJECT), async {
            let frame = link.from_client.recv().await.unwrap();
            ack(&link, &frame, Value::Null).await;
            frame
        })
    })
    .await;
    left.unwrap();

    assert_eq!(frame.event, events::LEAVE_ROOM);
    assert!(rooms.active_rooms().is_empty());
    assert!(rooms.members(PROJECT).is_empty());
}

#[tokio::test]
async fn test_rooms_rejoined_after_reconnect() {
    let mut harness = Harness::new(config());
    let mut link = harness.login().await;
    let studio = harness.studio.clone();

    let (opened, _) = within(async {
        tokio::join!(studio.open_project(PROJECT), async {
            let join = expect(&mut link, events::JOIN_ROOM).await;
            ack(&link, &join, Value::Null).await;
        })
    })
    .await;
    assert_eq!(opened, Ok(0));

    drop(link);
    let mut link = within(accept(&mut harness.server)).await;
    let rejoin = within(expect(&mut link, events::JOIN_ROOM)).await;
    assert_eq!(rejoin.data, json!({ "projectId": PROJECT }));
    ack(&link, &rejoin, Value::Null).await;
    assert!(studio.rooms().is_active(PROJECT));
}

#[tokio::test]
async fn test_presence_broadcasts_carry_identity() {
    let mut harness = Harness::new(config());
    let mut link = harness.login().await;
    let rooms = harness.studio.rooms();

    rooms.broadcast_typing(PROJECT, true).await;
    let typing = within(expect(&mut link, events::TYPING)).await;
    assert_eq!(
        typing.data,
        json!({ "projectId": PROJECT, "userId": "u1", "isTyping": true })
    );
    assert!(typing.request_id.is_none());

    rooms
        .broadcast_cursor(PROJECT, CursorPosition { line: 12, column: 4 })
        .await;
    let cursor = within(expect(&mut link, events::CURSOR_POSITION)).await;
    assert_eq!(cursor.data["position"], json!({ "line": 12, "column": 4 }));

    rooms
        .broadcast_code_change(PROJECT, json!([{ "file": "index.html", "op": "replace" }]))
        .await;
    let change = within(expect(&mut link, events::CODE_CHANGES)).await;
    assert_eq!(change.data["changes"][0]["file"], "index.html");
}

#[tokio::test]
async fn test_rejected_join_is_not_kept() {
    let mut harness = Harness::new(config());
    let mut link = harness.login().await;
    let rooms = harness.studio.rooms().clone();

    let (joined, _) = within(async {
        tokio::join!(rooms.join_room(PROJECT), async {
            let join = expect(&mut link, events::JOIN_ROOM).await;
            link.to_client
                .send(Envelope::nack(
                    join.request_id.unwrap(),
                    "forbidden",
                ))
                .await
                .unwrap();
        })
    })
    .await;

    assert!(joined.is_err());
    assert!(!rooms.is_active(PROJECT));
}

#[tokio::test]
async fn test_rejected_rejoin_drops_room() {
    let mut harness = Harness::new(config());
    let mut link = harness.login().await;
    let rooms = harness.studio.rooms().clone();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    rooms.on_user_joined(move |event| {
        let _ = seen_tx.send(event.user_id.clone());
    });

    let (joined, _) = within(async {
        tokio::join!(rooms.join_room(PROJECT), async {
            let join = expect(&mut link, events::JOIN_ROOM).await;
            ack(&link, &join, Value::Null).await;
        })
    })
    .await;
    joined.unwrap();

    drop(link);
    let mut link = within(accept(&mut harness.server)).await;
    let rejoin = within(expect(&mut link, events::JOIN_ROOM)).await;
    link.to_client
        .send(Envelope::nack(rejoin.request_id.unwrap(), "project archived"))
        .await
        .unwrap();

    within(async {
        while rooms.is_active(PROJECT) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await;

    // Events for the dropped room no longer reach listeners.
    push(&link, events::USER_JOINED, json!({ "projectId": PROJECT, "userId": "u2" })).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(seen_rx.try_recv().is_err());
}
