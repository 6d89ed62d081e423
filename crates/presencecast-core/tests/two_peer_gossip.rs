//! Two-node presence gossip
//!
//! Two nodes share one link. One advertises clients and rooms; the other
//! must discover them exactly once and keep its recorded hashes current.

mod common;

use common::*;
use presencecast_core::{
    Blake3Hasher, DiscoveryEvent, DiscoveryManager, MemoryNetwork, PresenceHasher, PresenceType,
    Stanza, StanzaKind,
};

// ============================================================================
// Client discovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_peer_discovery_exactly_once() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, config(1, &["lan"]));
    let mut b = TestNode::start(&network, config(2, &["lan"]));

    let presence = available("user1@proxy");
    let h1 = Blake3Hasher.hash(&presence);
    a.service.presence().advertise_client(&presence).unwrap();

    b.wait_for(discovered("user1@proxy")).await;
    run_for(5).await;

    let late_discoveries = b
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, DiscoveryEvent::ClientDiscovered(_)))
        .count();
    assert_eq!(late_discoveries, 0);

    let peer = b.service.presence().peer(a.id()).unwrap();
    assert_eq!(peer.identity_hashes[&jid("user1@proxy")], h1);
    assert!(peer.connected);
    assert!(peer.seq > 1);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_alone_discovers_and_probes() {
    let network = MemoryNetwork::new();
    let mut a = TestNode::start(&network, config(1, &["lan"]));

    // Advertised before the second node exists, so only gossip can tell it
    let presence = available("user1@proxy").with_status("early bird");
    a.service.presence().advertise_client(&presence).unwrap();

    let mut b = TestNode::start(&network, config(2, &["lan"]));
    let event = b.wait_for(discovered("user1@proxy")).await;
    match event {
        DiscoveryEvent::ClientDiscovered(p) => assert_eq!(p.status, None),
        other => panic!("unexpected {:?}", other),
    }

    // The probe reaches the owning node, addressed to the client
    let probe = a
        .wait_for(|e| matches!(e, DiscoveryEvent::ClientUpdated(p) if p.is_probe()))
        .await;
    match probe {
        DiscoveryEvent::ClientUpdated(p) => {
            assert_eq!(p.to, Some(jid("user1@proxy")));
            assert_eq!(p.from, Some(jid("proxy")));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_update_and_removal() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, config(1, &["lan"]));
    let mut b = TestNode::start(&network, config(2, &["lan"]));

    a.service
        .presence()
        .advertise_client(&available("user1@proxy"))
        .unwrap();
    b.wait_for(discovered("user1@proxy")).await;

    let away = available("user1@proxy").with_status("away");
    a.service.presence().update_client_status(&away).unwrap();
    let updated = b
        .wait_for(|e| matches!(e, DiscoveryEvent::ClientUpdated(p) if p.status.is_some()))
        .await;
    assert_eq!(updated, DiscoveryEvent::ClientUpdated(away.clone()));
    assert_eq!(
        b.service.presence().last_presence(&jid("user1@proxy")),
        Some(away.clone())
    );
    assert_eq!(
        b.service.presence().peer(a.id()).unwrap().identity_hashes[&jid("user1@proxy")],
        Blake3Hasher.hash(&away)
    );

    a.service.presence().remove_client(&away).unwrap();
    let removed = b
        .wait_for(|e| matches!(e, DiscoveryEvent::ClientRemoved(_)))
        .await;
    match removed {
        DiscoveryEvent::ClientRemoved(p) => {
            assert_eq!(p.presence_type(), PresenceType::Unavailable);
            assert_eq!(p.from, Some(jid("user1@proxy")));
        }
        other => panic!("unexpected {:?}", other),
    }

    run_for(3).await;
    assert!(b
        .service
        .presence()
        .peer(a.id())
        .unwrap()
        .identity_hashes
        .is_empty());
    assert!(!b
        .drain_events()
        .iter()
        .any(|e| matches!(e, DiscoveryEvent::ClientDiscovered(_))));
}

/// Run `a` for `ticks` intervals, answering every probe with the client's
/// current presence the way a hosting node does. Returns the probe count.
async fn answer_probes(a: &mut TestNode, presence: &Stanza, ticks: u32) -> usize {
    let mut probes = 0;
    for _ in 0..ticks * 10 {
        tokio::time::sleep(INTERVAL / 10).await;
        for event in a.drain_events() {
            if matches!(&event, DiscoveryEvent::ClientUpdated(p) if p.is_probe() && p.to == presence.from)
            {
                probes += 1;
                a.service.presence().update_client_status(presence).unwrap();
            }
        }
    }
    probes
}

#[tokio::test(start_paused = true)]
async fn test_answered_probe_is_not_repeated() {
    let network = MemoryNetwork::new();
    let mut a = TestNode::start(&network, config(1, &["lan"]));

    let presence = available("user1@proxy").with_status("  brb,  back in 5 ");
    a.service.presence().advertise_client(&presence).unwrap();

    let mut b = TestNode::start(&network, config(2, &["lan"]));
    b.wait_for(discovered("user1@proxy")).await;

    assert_eq!(answer_probes(&mut a, &presence, 3).await, 1);
    assert_eq!(
        b.service.presence().last_presence(&jid("user1@proxy")),
        Some(presence.clone())
    );
    assert_eq!(
        b.service.presence().peer(a.id()).unwrap().identity_hashes[&jid("user1@proxy")],
        Blake3Hasher.hash(&presence)
    );

    // Steady state: the hash matches, so gossip alone never probes again
    assert_eq!(answer_probes(&mut a, &presence, 10).await, 0);
}

// ============================================================================
// Rooms
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_room_discovery_and_occupancy_via_gossip() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, config(1, &["lan"]));
    let mut b = TestNode::start(&network, config(2, &["lan"]));
    let room = jid("room@conference.proxy");

    a.service.presence().advertise_muc_room(&room).unwrap();
    assert_eq!(
        b.wait_for(|e| matches!(e, DiscoveryEvent::RoomAdded(_))).await,
        DiscoveryEvent::RoomAdded(room.clone())
    );

    // No room channel on either side: the occupant only travels in snapshots
    let join = Stanza::presence()
        .with_from(jid("user1@proxy"))
        .with_to(jid("room@conference.proxy/user1"));
    a.service.presence().advertise_muc_occupant(&join).unwrap();

    let joined = b
        .wait_for(|e| matches!(e, DiscoveryEvent::OccupantJoined(_)))
        .await;
    match joined {
        DiscoveryEvent::OccupantJoined(p) => {
            assert_eq!(p.from, Some(jid("user1@proxy")));
            assert_eq!(p.to, Some(jid("room@conference.proxy/user1")));
        }
        other => panic!("unexpected {:?}", other),
    }
    let occupants = b.service.presence().occupants(&room);
    assert_eq!(occupants.len(), 1);
    assert_eq!(occupants[0].nickname, "user1");
    assert_eq!(occupants[0].node_id, Some(a.id()));

    a.service.presence().remove_muc_occupant(&join).unwrap();
    let exited = b
        .wait_for(|e| matches!(e, DiscoveryEvent::OccupantExited(_)))
        .await;
    match exited {
        DiscoveryEvent::OccupantExited(p) => {
            assert_eq!(p.presence_type(), PresenceType::Unavailable);
            assert_eq!(p.to, Some(jid("room@conference.proxy/user1")));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(b.service.presence().occupants(&room).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_room_presence_on_room_channel() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, config(1, &["lan"]));
    let mut b = TestNode::start(&network, config(2, &["lan"]));
    let room = jid("room@conference.proxy");

    let a_room = a.service.create_room_transport(&room).unwrap();
    let b_room = b.service.create_room_transport(&room).unwrap();
    assert_eq!(a_room.sessions().sending.len(), 1);
    assert_eq!(
        a.service.ports().port_for(room.as_str()),
        b.service.ports().port_for(room.as_str())
    );

    let mut join = Stanza::presence()
        .with_from(jid("user1@proxy"))
        .with_to(jid("room@conference.proxy/user1"))
        .with_status("hello room");
    join.add_muc_marker();
    a.service.presence().advertise_muc_occupant(&join).unwrap();

    // The direct presence keeps its status, unlike a gossip-synthesized one
    let joined = b
        .wait_for(|e| matches!(e, DiscoveryEvent::OccupantJoined(_)))
        .await;
    assert_eq!(joined, DiscoveryEvent::OccupantJoined(join.clone()));

    run_for(3).await;
    let joins = b
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, DiscoveryEvent::OccupantJoined(_)))
        .count();
    assert_eq!(joins, 0);

    // Group chat on the room channel reaches the sink
    let message = Stanza::new(StanzaKind::Message)
        .with_from(jid("user1@proxy"))
        .with_to(room.clone())
        .with_type("groupchat")
        .with_body("hi all");
    a_room.send_packet(&message).unwrap();
    let received = b.next_packet().await;
    assert_eq!(received.from, Some(jid("user1@proxy")));
    assert_eq!(received.packet.body.as_deref(), Some("hi all"));
    assert!(!received.packet.has_delay());
    drop(b_room);
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_one_to_one_chat() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, config(1, &["lan"]));
    let mut b = TestNode::start(&network, config(2, &["lan"]));

    let a_chat = a.service.create_one_to_one_transport().unwrap();
    b.service.create_one_to_one_transport().unwrap();

    let message = Stanza::new(StanzaKind::Message)
        .with_from(jid("user1@proxy"))
        .with_to(jid("user2@proxy"))
        .with_type("chat")
        .with_body("ping");
    a_chat.send_packet(&message).unwrap();

    let received = b.next_packet().await;
    assert_eq!(received.packet, message);

    let iq = Stanza::new(StanzaKind::Iq)
        .with_from(jid("user1@proxy"))
        .with_to(jid("user2@proxy"))
        .with_type("get");
    a_chat.send_packet(&iq).unwrap();
    assert_eq!(b.next_packet().await.packet.kind, StanzaKind::Iq);
}

#[tokio::test(start_paused = true)]
async fn test_chat_text_arrives_verbatim() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, config(1, &["lan"]));
    let mut b = TestNode::start(&network, config(2, &["lan"]));

    let a_chat = a.service.create_one_to_one_transport().unwrap();
    b.service.create_one_to_one_transport().unwrap();

    for body in ["  indented\ncode\n", "two  spaces", "\t", " "] {
        let message = Stanza::new(StanzaKind::Message)
            .with_from(jid("user1@proxy"))
            .with_to(jid("user2@proxy"))
            .with_type("chat")
            .with_body(body);
        a_chat.send_packet(&message).unwrap();
        assert_eq!(b.next_packet().await.packet, message);
    }
}

#[tokio::test(start_paused = true)]
async fn test_compressed_network() {
    let network = MemoryNetwork::new();
    let mut cfg_a = config(1, &["lan"]);
    cfg_a.compression = true;
    let mut cfg_b = config(2, &["lan"]);
    cfg_b.compression = true;

    let a = TestNode::start(&network, cfg_a);
    let mut b = TestNode::start(&network, cfg_b);
    a.service
        .presence()
        .advertise_client(&available("zip@proxy"))
        .unwrap();
    b.wait_for(discovered("zip@proxy")).await;

    let a_chat = a.service.create_one_to_one_transport().unwrap();
    b.service.create_one_to_one_transport().unwrap();
    a_chat
        .send_packet(&Stanza::new(StanzaKind::Message).with_body("squeezed"))
        .unwrap();
    assert_eq!(
        b.next_packet().await.packet.body.as_deref(),
        Some("squeezed")
    );
}
