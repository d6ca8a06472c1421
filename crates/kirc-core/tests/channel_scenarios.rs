mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use kirc_core::relay;
use kirc_core::{CoreError, LeaseRole, Node, NodeEvent};
use kirc_net::{CoordinationCache, Mailbox, MailboxChannel};
use kirc_shared::crypto;
use kirc_shared::identity::Identity;
use kirc_shared::protocol::RpcMessage;
use kirc_shared::types::KeyId;
use kirc_shared::PresenceStatus;
use kirc_store::Database;

use common::{channel, eventually, introduce, none_within, user, wait_for, Cluster};

#[tokio::test]
async fn net_runners_join_relay_and_kick() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let ch = channel("#NET_RUNNERS");

    assert_eq!(alice.join(&ch).await.unwrap(), LeaseRole::Leader);
    assert_eq!(cluster.leader(&ch).await.as_deref(), Some("alice"));
    let id1 = alice.current_key_id(&ch).unwrap();

    let mut bob_events = bob.subscribe();
    assert_eq!(
        bob.join(&ch).await.unwrap(),
        LeaseRole::Follower {
            leader: user("alice")
        }
    );
    wait_for(&mut bob_events, |e| {
        matches!(e, NodeEvent::KeyInstalled { key_id, .. } if *key_id == id1)
    })
    .await;
    assert_eq!(bob.resolve_key(&ch, &id1), alice.resolve_key(&ch, &id1));

    let status = alice.status(&ch).await.unwrap();
    assert_eq!(status.members, BTreeSet::from([user("alice"), user("bob")]));

    alice.send(&ch, "hello").await.unwrap();
    let received = wait_for(&mut bob_events, |e| matches!(e, NodeEvent::Message { .. })).await;
    match received {
        NodeEvent::Message { sender, text, .. } => {
            assert_eq!(sender, user("alice"));
            assert_eq!(text, "hello");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let id2 = alice.kick(&ch, &user("bob")).await.unwrap();
    assert_ne!(id1, id2);
    wait_for(&mut bob_events, |e| matches!(e, NodeEvent::Kicked { .. })).await;

    assert!(bob.resolve_key(&ch, &id2).is_none());
    assert!(alice.resolve_key(&ch, &id2).is_some());
    assert_eq!(alice.current_key_id(&ch), Some(id2));
    assert!(bob.role(&ch).is_none());
    assert_eq!(
        alice.status(&ch).await.unwrap().members,
        BTreeSet::from([user("alice")])
    );

    // Nothing sent under the new epoch reaches bob
    alice.send(&ch, "after the kick").await.unwrap();
    assert!(
        none_within(&mut bob_events, Duration::from_millis(400), |e| {
            matches!(e, NodeEvent::Message { .. })
        })
        .await
    );
}

#[tokio::test]
async fn follower_takes_over_after_leader_crash() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    let carol = cluster.node("carol").await;
    introduce(&[&alice, &bob, &carol]);
    let ch = channel("#NET_RUNNERS");

    alice.join(&ch).await.unwrap();
    let id1 = alice.current_key_id(&ch).unwrap();
    bob.join(&ch).await.unwrap();
    carol.join(&ch).await.unwrap();
    eventually(|| bob.resolve_key(&ch, &id1).is_some() && carol.resolve_key(&ch, &id1).is_some()).await;

    // No leave, no release: the lease has to expire
    alice.halt();

    let leader = cluster
        .wait_for_leader(&ch, |holder| holder == "bob" || holder == "carol")
        .await;
    let (new_leader, follower): (&Node, &Node) = if leader == "bob" {
        (&bob, &carol)
    } else {
        (&carol, &bob)
    };
    eventually(|| new_leader.role(&ch) == Some(LeaseRole::Leader)).await;

    let mut leader_events = new_leader.subscribe();
    follower.send(&ch, "still here").await.unwrap();
    let received = wait_for(&mut leader_events, |e| matches!(e, NodeEvent::Message { .. })).await;
    match received {
        NodeEvent::Message { sender, text, .. } => {
            assert_eq!(&sender, follower.me());
            assert_eq!(text, "still here");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn leave_hands_the_lease_over() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let ch = channel("#lobby");

    alice.join(&ch).await.unwrap();
    bob.join(&ch).await.unwrap();

    alice.leave(&ch).await.unwrap();
    assert!(alice.role(&ch).is_none());
    assert!(matches!(alice.leave(&ch).await, Err(CoreError::NotJoined(_))));

    eventually(|| bob.role(&ch) == Some(LeaseRole::Leader)).await;
    let status = bob.status(&ch).await.unwrap();
    assert_eq!(status.leader, Some(user("bob")));
    assert_eq!(status.members, BTreeSet::from([user("bob")]));
}

#[tokio::test]
async fn leader_only_operations() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let ch = channel("#NET_RUNNERS");

    alice.join(&ch).await.unwrap();
    bob.join(&ch).await.unwrap();

    assert!(matches!(
        bob.kick(&ch, &user("alice")).await,
        Err(CoreError::NotLeader(_))
    ));
    assert!(matches!(
        bob.set_topic(&ch, "hijacked").await,
        Err(CoreError::NotLeader(_))
    ));
    assert!(matches!(
        alice.kick(&ch, &user("alice")).await,
        Err(CoreError::CannotKickSelf(_))
    ));

    alice.set_topic(&ch, "night city ops").await.unwrap();
    let status = bob.status(&ch).await.unwrap();
    assert_eq!(status.metadata.get("topic").map(String::as_str), Some("night city ops"));
    assert_eq!(status.metadata.get("set_by").map(String::as_str), Some("alice"));

    let other = channel("#elsewhere");
    assert!(matches!(alice.send(&other, "hi").await, Err(CoreError::NotJoined(_))));
}

#[tokio::test]
async fn relay_refuses_non_members() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let ch = channel("#NET_RUNNERS");
    alice.join(&ch).await.unwrap();
    let mut events = alice.subscribe();

    // Mallory never joined; the leader refuses without decrypting anything
    let key = crypto::generate_symmetric_key();
    let forged = relay::seal_chat(
        &user("mallory"),
        &ch,
        &user("alice"),
        &KeyId::from_string("forged"),
        &key,
        "let me in",
    )
    .unwrap();
    let relayed_before = cluster.broker.len(MailboxChannel::DataOut);
    cluster
        .broker
        .produce(MailboxChannel::DataIn, ch.as_str(), forged.to_bytes().unwrap())
        .await
        .unwrap();

    let rejected = wait_for(&mut events, |e| matches!(e, NodeEvent::RelayRejected { .. })).await;
    assert_eq!(
        rejected,
        NodeEvent::RelayRejected {
            channel: ch.clone(),
            sender: user("mallory")
        }
    );
    assert_eq!(cluster.broker.len(MailboxChannel::DataOut), relayed_before);
}

#[tokio::test]
async fn in_flight_envelope_is_resolved_through_a_key_request() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    let carol = cluster.node("carol").await;
    introduce(&[&alice, &bob, &carol]);
    let ch = channel("#NET_RUNNERS");

    alice.join(&ch).await.unwrap();
    let id1 = alice.current_key_id(&ch).unwrap();
    let k1 = alice.resolve_key(&ch, &id1).unwrap();
    bob.join(&ch).await.unwrap();
    let id2 = alice.kick(&ch, &user("bob")).await.unwrap();

    let mut carol_events = carol.subscribe();
    carol.join(&ch).await.unwrap();
    wait_for(&mut carol_events, |e| {
        matches!(e, NodeEvent::KeyInstalled { key_id, .. } if *key_id == id2)
    })
    .await;
    assert!(carol.resolve_key(&ch, &id1).is_none());

    // An envelope from before the rotation, still on its way out
    let late = relay::seal_chat(&user("alice"), &ch, &user("alice"), &id1, &k1, "late").unwrap();
    cluster
        .broker
        .produce(MailboxChannel::DataOut, ch.as_str(), late.to_bytes().unwrap())
        .await
        .unwrap();

    let received = wait_for(&mut carol_events, |e| matches!(e, NodeEvent::Message { .. })).await;
    assert!(matches!(received, NodeEvent::Message { ref text, .. } if text == "late"));
    assert_eq!(carol.resolve_key(&ch, &id1), Some(k1));
    // The old epoch was retained, not promoted
    assert_eq!(carol.current_key_id(&ch), Some(id2));
}

#[tokio::test]
async fn unknown_epoch_is_dropped_after_retries() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let ch = channel("#NET_RUNNERS");

    alice.join(&ch).await.unwrap();
    let mut bob_events = bob.subscribe();
    bob.join(&ch).await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, NodeEvent::KeyInstalled { .. })).await;

    let ghost = KeyId::from_string("ghost-epoch");
    let envelope = relay::seal_chat(
        &user("alice"),
        &ch,
        &user("alice"),
        &ghost,
        &crypto::generate_symmetric_key(),
        "unreadable",
    )
    .unwrap();
    cluster
        .broker
        .produce(MailboxChannel::DataOut, ch.as_str(), envelope.to_bytes().unwrap())
        .await
        .unwrap();

    let dropped = wait_for(&mut bob_events, |e| matches!(e, NodeEvent::Undecryptable { .. })).await;
    assert_eq!(
        dropped,
        NodeEvent::Undecryptable {
            channel: ch.clone(),
            key_id: ghost.clone(),
            sender: user("alice")
        }
    );
    assert!(bob.resolve_key(&ch, &ghost).is_none());
}

#[tokio::test]
async fn direct_messages_skip_the_leader() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let mut bob_events = bob.subscribe();

    alice.send_direct(&user("bob"), "psst").await.unwrap();
    let received = wait_for(&mut bob_events, |e| matches!(e, NodeEvent::DirectMessage { .. })).await;
    match received {
        NodeEvent::DirectMessage { sender, text, .. } => {
            assert_eq!(sender, user("alice"));
            assert_eq!(text, "psst");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(cluster.broker.len(MailboxChannel::DataOut), 0);

    assert!(matches!(
        alice.send_direct(&user("stranger"), "hi").await,
        Err(CoreError::UnknownContact(_))
    ));
}

#[tokio::test]
async fn presence_reaches_contacts() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let mut bob_events = bob.subscribe();

    assert_eq!(
        alice
            .set_presence(kirc_shared::PresenceStatus::Away)
            .await
            .unwrap(),
        1
    );
    let event = wait_for(&mut bob_events, |e| matches!(e, NodeEvent::Presence { .. })).await;
    assert_eq!(
        event,
        NodeEvent::Presence {
            username: user("alice"),
            status: kirc_shared::PresenceStatus::Away
        }
    );
}

#[tokio::test]
async fn keys_and_channels_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::new();
    let identity = Identity::generate(user("alice"), "Alice");
    let ch = channel("#NET_RUNNERS");

    let first = Node::start(cluster.context(identity.clone(), Database::open(dir.path()).unwrap()))
        .await
        .unwrap();
    first.join(&ch).await.unwrap();
    let id1 = first.current_key_id(&ch).unwrap();
    let k1 = first.resolve_key(&ch, &id1).unwrap();
    first.send(&ch, "remember me").await.unwrap();
    first.halt();

    let second = Node::start(cluster.context(identity, Database::open(dir.path()).unwrap()))
        .await
        .unwrap();
    assert_eq!(second.restore_keys().unwrap(), 1);
    assert_eq!(second.resolve_key(&ch, &id1), Some(k1));
    assert_eq!(second.current_key_id(&ch), Some(id1));

    // Our own lease from before the crash is picked straight back up
    assert_eq!(second.rejoin_saved_channels().await.unwrap(), vec![ch.clone()]);
    assert_eq!(second.role(&ch), Some(LeaseRole::Leader));
    assert_eq!(second.history(&ch, 10).unwrap().len(), 1);

    second.shutdown().await;
    assert!(cluster.leader(&ch).await.is_none());
}

#[tokio::test]
async fn kicked_member_stays_locked_out_after_failover() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    let carol = cluster.node("carol").await;
    let dave = cluster.node("dave").await;
    introduce(&[&alice, &bob, &carol, &dave]);
    let ch = channel("#NET_RUNNERS");

    alice.join(&ch).await.unwrap();
    let id1 = alice.current_key_id(&ch).unwrap();
    let k1 = alice.resolve_key(&ch, &id1).unwrap();
    for node in [&bob, &carol, &dave] {
        node.join(&ch).await.unwrap();
    }
    eventually(|| [&bob, &carol, &dave].iter().all(|n| n.resolve_key(&ch, &id1).is_some())).await;

    let id2 = alice.kick(&ch, &user("carol")).await.unwrap();
    eventually(|| {
        bob.current_key_id(&ch) == Some(id2.clone()) && dave.current_key_id(&ch) == Some(id2.clone())
    })
    .await;
    alice.halt();

    let leader = cluster
        .wait_for_leader(&ch, |holder| holder == "bob" || holder == "dave")
        .await;
    let (new_leader, member): (&Node, &Node) = if leader == "bob" {
        (&bob, &dave)
    } else {
        (&dave, &bob)
    };
    eventually(|| new_leader.role(&ch) == Some(LeaseRole::Leader)).await;

    // The lease holder pushing the pre-kick epoch as current again
    let sealed = crypto::seal(&member.context().identity.public_key().encryption, &k1).unwrap();
    new_leader
        .context()
        .send_rpc(
            MailboxChannel::RpcIn,
            member.me(),
            RpcMessage::KeyUpdate {
                channel: ch.clone(),
                key_id: id1.clone(),
                encrypted_key: sealed,
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let current = member.current_key_id(&ch).unwrap();
    assert_ne!(current, id1);
    assert_eq!(new_leader.current_key_id(&ch), Some(current.clone()));
    assert!(carol.resolve_key(&ch, &current).is_none());

    let mut leader_events = new_leader.subscribe();
    member.send(&ch, "carol is gone").await.unwrap();
    let received = wait_for(&mut leader_events, |e| matches!(e, NodeEvent::Message { .. })).await;
    assert!(matches!(received, NodeEvent::Message { ref text, .. } if text == "carol is gone"));
}

#[tokio::test]
async fn successor_behind_the_latest_epoch_rotates() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let ch = channel("#NET_RUNNERS");

    alice.join(&ch).await.unwrap();
    let id1 = alice.current_key_id(&ch).unwrap();
    bob.join(&ch).await.unwrap();
    eventually(|| bob.current_key_id(&ch) == Some(id1.clone())).await;

    // A rotation bob never heard about before alice went down
    cluster
        .cache
        .hash_set(&ch.status_key(), "key_id", "missed-epoch")
        .await
        .unwrap();
    alice.halt();

    cluster.wait_for_leader(&ch, |holder| holder == "bob").await;
    eventually(|| {
        bob.current_key_id(&ch)
            .is_some_and(|id| id != id1 && id.as_str() != "missed-epoch")
    })
    .await;
    let latest = cluster.cache.hash_get_all(&ch.status_key()).await.unwrap();
    assert_eq!(latest.get("key_by").map(String::as_str), Some("bob"));
    assert_eq!(
        latest.get("key_id").map(String::as_str),
        bob.current_key_id(&ch).as_ref().map(KeyId::as_str)
    );
}

#[tokio::test]
async fn failed_leave_can_be_retried() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let ch = channel("#lobby");

    alice.join(&ch).await.unwrap();
    bob.join(&ch).await.unwrap();

    cluster.cache.set_available(false);
    assert!(matches!(alice.leave(&ch).await, Err(CoreError::Cache(_))));
    assert!(alice.role(&ch).is_some());
    assert_eq!(alice.joined_channels(), vec![ch.clone()]);
    cluster.cache.set_available(true);

    alice.leave(&ch).await.unwrap();
    assert!(alice.role(&ch).is_none());
    let members = cluster.cache.set_members(&ch.members_key()).await.unwrap();
    assert!(!members.contains("alice"));
    assert_ne!(cluster.leader(&ch).await.as_deref(), Some("alice"));

    eventually(|| bob.role(&ch) == Some(LeaseRole::Leader)).await;
}

#[tokio::test]
async fn cache_outage_resets_roles_and_recovers() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let ch = channel("#NET_RUNNERS");

    alice.join(&ch).await.unwrap();
    let id1 = alice.current_key_id(&ch).unwrap();
    bob.join(&ch).await.unwrap();
    eventually(|| bob.resolve_key(&ch, &id1).is_some()).await;

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    cluster.cache.set_available(false);
    for events in [&mut alice_events, &mut bob_events] {
        wait_for(events, |e| {
            matches!(e, NodeEvent::ConnectivityLost { component } if component == "cache")
        })
        .await;
    }
    assert_eq!(alice.role(&ch), Some(LeaseRole::None));
    assert_eq!(bob.role(&ch), Some(LeaseRole::None));

    // Longer than the lease: nothing from before the outage survives
    tokio::time::sleep(Duration::from_millis(700)).await;
    cluster.cache.set_available(true);

    let holder = cluster
        .wait_for_leader(&ch, |holder| holder == "alice" || holder == "bob")
        .await;
    let (leader, follower): (&Node, &Node) = if holder == "alice" {
        (&alice, &bob)
    } else {
        (&bob, &alice)
    };
    eventually(|| {
        leader.role(&ch) == Some(LeaseRole::Leader)
            && follower.role(&ch)
                == Some(LeaseRole::Follower {
                    leader: leader.me().clone(),
                })
    })
    .await;
    let members = cluster.cache.set_members(&ch.members_key()).await.unwrap();
    assert_eq!(members.len(), 2);

    let mut leader_events = leader.subscribe();
    eventually(|| follower.current_key_id(&ch).is_some()).await;
    follower.send(&ch, "back online").await.unwrap();
    let received = wait_for(&mut leader_events, |e| matches!(e, NodeEvent::Message { .. })).await;
    assert!(matches!(received, NodeEvent::Message { ref text, .. } if text == "back online"));
}

#[tokio::test]
async fn presence_and_typing_are_queryable() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    introduce(&[&alice, &bob]);
    let ch = channel("#NET_RUNNERS");
    alice.join(&ch).await.unwrap();
    bob.join(&ch).await.unwrap();

    assert_eq!(bob.presence(&user("alice")).await.unwrap(), PresenceStatus::Offline);
    alice.set_presence(PresenceStatus::Away).await.unwrap();
    assert_eq!(bob.presence(&user("alice")).await.unwrap(), PresenceStatus::Away);

    // Kept alive by refreshing, gone once refreshes stop
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(alice.refresh_presence().await.unwrap());
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bob.presence(&user("alice")).await.unwrap(), PresenceStatus::Away);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bob.presence(&user("alice")).await.unwrap(), PresenceStatus::Offline);
    assert!(!alice.refresh_presence().await.unwrap());

    alice.set_typing(&ch, true).await.unwrap();
    bob.set_typing(&ch, true).await.unwrap();
    assert_eq!(
        alice.typing_users(&ch).await.unwrap(),
        BTreeSet::from([user("alice"), user("bob")])
    );
    bob.set_typing(&ch, false).await.unwrap();
    assert_eq!(alice.typing_users(&ch).await.unwrap(), BTreeSet::from([user("alice")]));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(bob.typing_users(&ch).await.unwrap().is_empty());
}

#[tokio::test]
async fn blocked_contacts_get_no_keys_or_direct_messages() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    let carol = cluster.node("carol").await;
    introduce(&[&alice, &bob, &carol]);
    let ch = channel("#NET_RUNNERS");

    alice.block(&user("bob")).unwrap();
    assert!(matches!(alice.block(&user("stranger")), Err(CoreError::UnknownContact(_))));
    assert!(matches!(
        alice.send_direct(&user("bob"), "hi").await,
        Err(CoreError::Blocked(_))
    ));

    let mut alice_events = alice.subscribe();
    bob.send_direct(&user("alice"), "let me in").await.unwrap();
    carol.send_direct(&user("alice"), "hi alice").await.unwrap();
    let received = wait_for(&mut alice_events, |e| matches!(e, NodeEvent::DirectMessage { .. })).await;
    assert!(matches!(received, NodeEvent::DirectMessage { ref sender, .. } if *sender == user("carol")));

    alice.join(&ch).await.unwrap();
    let id1 = alice.current_key_id(&ch).unwrap();
    let mut bob_events = bob.subscribe();
    bob.join(&ch).await.unwrap();
    carol.join(&ch).await.unwrap();
    eventually(|| carol.resolve_key(&ch, &id1).is_some()).await;
    assert!(
        none_within(&mut bob_events, Duration::from_millis(400), |e| {
            matches!(e, NodeEvent::KeyInstalled { .. })
        })
        .await
    );
    assert!(bob.resolve_key(&ch, &id1).is_none());
}

#[tokio::test]
async fn kick_reports_members_left_without_the_new_key() {
    let cluster = Cluster::new();
    let alice = cluster.node("alice").await;
    let bob = cluster.node("bob").await;
    let carol = cluster.node("carol").await;
    // Alice never accepted an invite from carol
    introduce(&[&alice, &bob]);
    let ch = channel("#NET_RUNNERS");

    alice.join(&ch).await.unwrap();
    bob.join(&ch).await.unwrap();
    carol.join(&ch).await.unwrap();

    let mut alice_events = alice.subscribe();
    let id2 = alice.kick(&ch, &user("bob")).await.unwrap();
    let event = wait_for(&mut alice_events, |e| {
        matches!(e, NodeEvent::KeyUndelivered { key_id, .. } if *key_id == id2)
    })
    .await;
    assert_eq!(
        event,
        NodeEvent::KeyUndelivered {
            channel: ch.clone(),
            key_id: id2,
            members: vec![user("carol")],
        }
    );
}
