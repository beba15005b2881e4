//! Integration tests across the crypto and core crates.
//!
//! Drives full negotiations over the in-memory transport, plays a hostile
//! peer against an honest engine by hand-writing wire messages, and checks
//! channel ordering and the connection manager end to end.

use peerlink_core::config::NegotiationConfig;
use peerlink_core::negotiation::{encrypt_message_key, open_message_key};
use peerlink_core::programs::send_message;
use peerlink_core::wire;
use peerlink_core::{
    ChannelConfig, ChannelEvent, LinkConditions, MemoryNetwork, Message, NegotiationEngine,
    NegotiationState, NodeConfig, PacketData, ProtocolError, SecureChannel, Signaling,
};
use peerlink_crypto::{
    CHALLENGE_SIZE, IdentityPublicKey, KeyCodec, MessagingKeyPair, RSA_BLOCK_SIZE, SessionKey,
};
use peerlink_integration_tests::{TwoPeerFixture, identity_a, identity_b, identity_c};
use std::collections::HashSet;
use std::time::Duration;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

fn username(name: &str) -> Message {
    Message::Map(vec![(
        Message::Text("username".into()),
        Message::Text(name.into()),
    )])
}

fn shared_key() -> SessionKey {
    SessionKey::from_shared_secret(&[0x5e; 32]).unwrap()
}

// ============================================================================
// Negotiation
// ============================================================================

/// Both engines reach Authenticated with the same session key and each
/// other's extra data.
#[tokio::test]
async fn test_negotiation_end_to_end() {
    let (alice, bob) = (identity_a(), identity_b());
    let (mut a_conn, mut b_conn) =
        MemoryNetwork::new().link(alice.address().id(), bob.address().id());

    let mut initiator = NegotiationEngine::initiator(NegotiationConfig::default());
    let mut responder = NegotiationEngine::responder(NegotiationConfig::default());
    let (a_extra, b_extra) = (username("alice"), username("bob"));
    let (a, b) = tokio::join!(
        initiator.run(&mut a_conn, &alice, None, &a_extra),
        responder.run(&mut b_conn, &bob, None, &b_extra),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(initiator.state(), NegotiationState::Authenticated);
    assert_eq!(responder.state(), NegotiationState::Authenticated);
    assert!(a.session_key.same_key(&b.session_key));
    assert_eq!(a.peer.id(), bob.address().id());
    assert_eq!(b.peer.id(), alice.address().id());
    assert!(a.peer.is_first_contact());
    assert_eq!(a.extra_data, b_extra);
    assert_eq!(b.extra_data, a_extra);
}

/// Negotiation over a slow, duplicating link still completes.
#[tokio::test]
async fn test_negotiation_over_lossy_link() {
    let (alice, bob) = (identity_a(), identity_b());
    let network = MemoryNetwork::with_conditions(
        LinkConditions::new(Duration::from_millis(20), 0.25).with_seed(7),
    );
    let (mut a_conn, mut b_conn) = network.link(alice.address().id(), bob.address().id());

    let mut initiator = NegotiationEngine::initiator(NegotiationConfig::default());
    let mut responder = NegotiationEngine::responder(NegotiationConfig::default());
    let (a, b) = tokio::join!(
        initiator.run(&mut a_conn, &alice, None, &Message::Null),
        responder.run(&mut b_conn, &bob, None, &Message::Null),
    );
    assert!(a.unwrap().session_key.same_key(&b.unwrap().session_key));
}

/// A peer that claims alice's public key without holding her private key
/// cannot answer the responder's challenge.
#[tokio::test]
async fn test_impostor_fails_possession_challenge() {
    let (alice, bob) = (identity_a(), identity_b());
    let (mut attacker, mut b_conn) =
        MemoryNetwork::new().link(alice.address().id(), bob.address().id());

    let mut responder = NegotiationEngine::responder(NegotiationConfig::default());
    let impostor = async {
        let stage0 = attacker.recv().await.unwrap();
        let bob_record = wire::parse_address_key(&stage0, 0).unwrap();
        let bob_key = IdentityPublicKey::import_key(&bob_record).unwrap();

        let claimed = alice.keys().public_key().export_key();
        attacker
            .send(wire::negotiation_address_key(1, &claimed).unwrap())
            .await
            .unwrap();

        // Our own challenge to bob; his answer is encrypted to alice.
        let challenge = bob_key.encrypt_block(&[9u8; CHALLENGE_SIZE]).unwrap();
        attacker.send(wire::handshake_challenge(challenge)).await.unwrap();
        let _unreadable = attacker.recv().await.unwrap();
        attacker.send(wire::handshake_confirm()).await.unwrap();

        let _challenge = attacker.recv().await.unwrap();
        attacker
            .send(wire::handshake_response(vec![0x5a; RSA_BLOCK_SIZE]))
            .await
            .unwrap();
    };

    let (result, ()) = tokio::join!(
        responder.run(&mut b_conn, &bob, None, &Message::Null),
        impostor
    );
    assert!(matches!(result, Err(ProtocolError::IllegitimateKey)));
    assert_eq!(responder.state(), NegotiationState::Failed);
}

/// A message for the wrong stage is rejected as malformed.
#[tokio::test]
async fn test_out_of_order_stage_rejected() {
    let (alice, bob) = (identity_a(), identity_b());
    let (mut attacker, mut b_conn) =
        MemoryNetwork::new().link(alice.address().id(), bob.address().id());

    let mut responder = NegotiationEngine::responder(NegotiationConfig::default());
    let skipper = async {
        let _stage0 = attacker.recv().await.unwrap();
        attacker
            .send(wire::negotiation_message_key(2, vec![1, 2, 3]))
            .await
            .unwrap();
    };

    let (result, ()) = tokio::join!(
        responder.run(&mut b_conn, &bob, None, &Message::Null),
        skipper
    );
    assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));
}

/// A silent peer hits the first-response timeout.
#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let (alice, bob) = (identity_a(), identity_b());
    let (_silent, mut b_conn) =
        MemoryNetwork::new().link(alice.address().id(), bob.address().id());

    let mut responder = NegotiationEngine::responder(NegotiationConfig::default());
    let result = responder
        .run(&mut b_conn, &bob, None, &Message::Null)
        .await;
    match result {
        Err(err @ ProtocolError::ResponseTimeout { .. }) => assert!(err.is_timeout()),
        other => panic!("expected timeout, got {other:?}"),
    }
}

/// A messaging key bound to someone else's challenge is refused.
#[test]
fn test_nonce_substitution_rejected() {
    let (bob, carol) = (identity_b(), identity_c());
    let own_challenge = [0x11u8; CHALLENGE_SIZE];
    let replayed_challenge = [0x22u8; CHALLENGE_SIZE];
    let substitute = MessagingKeyPair::generate();

    let forged =
        encrypt_message_key(bob.keys().public_key(), substitute.public_key(), &replayed_challenge)
            .unwrap();
    assert!(matches!(
        open_message_key(bob.keys(), &forged, &own_challenge),
        Err(ProtocolError::InvalidNonce)
    ));

    let honest =
        encrypt_message_key(bob.keys().public_key(), substitute.public_key(), &own_challenge)
            .unwrap();
    let opened = open_message_key(bob.keys(), &honest, &own_challenge).unwrap();
    assert_eq!(&opened, substitute.public_key());

    // Relaying a key encrypted to another peer does not decrypt.
    assert!(matches!(
        open_message_key(carol.keys(), &honest, &own_challenge),
        Err(ProtocolError::Decryption(_))
    ));
}

/// An initiator that proves alice's identity honestly but then sends a
/// substituted messaging key bound to a stale nonce is refused at stage 2.
#[tokio::test]
async fn test_substituted_messaging_key_fails_negotiation() {
    let (alice, bob) = (identity_a(), identity_b());
    let (mut attacker, mut b_conn) =
        MemoryNetwork::new().link(alice.address().id(), bob.address().id());

    let mut responder = NegotiationEngine::responder(NegotiationConfig::default());
    let relay = async {
        let stage0 = attacker.recv().await.unwrap();
        let bob_record = wire::parse_address_key(&stage0, 0).unwrap();
        let bob_key = IdentityPublicKey::import_key(&bob_record).unwrap();
        attacker
            .send(wire::negotiation_address_key(1, &alice.keys().public_key().export_key()).unwrap())
            .await
            .unwrap();

        // Challenge run 1: pose to bob and check his echo.
        let own_challenge = [9u8; CHALLENGE_SIZE];
        attacker
            .send(wire::handshake_challenge(bob_key.encrypt_block(&own_challenge).unwrap()))
            .await
            .unwrap();
        let response = attacker.recv().await.unwrap();
        let echoed = alice
            .keys()
            .decrypt_block(wire::parse_handshake_response(&response).unwrap())
            .unwrap();
        assert_eq!(echoed, own_challenge);
        attacker.send(wire::handshake_confirm()).await.unwrap();

        // Challenge run 2: answer bob's challenge with alice's key.
        let challenge = attacker.recv().await.unwrap();
        let recovered = alice
            .keys()
            .decrypt_block(wire::parse_handshake_challenge(&challenge).unwrap())
            .unwrap();
        attacker
            .send(wire::handshake_response(bob_key.encrypt_block(&recovered).unwrap()))
            .await
            .unwrap();
        let confirm = attacker.recv().await.unwrap();
        wire::parse_handshake_confirm(&confirm).unwrap();

        // Stage 2 with a substituted key and the nonce from run 1.
        let substitute = MessagingKeyPair::generate();
        let forged =
            encrypt_message_key(&bob_key, substitute.public_key(), &own_challenge).unwrap();
        attacker
            .send(wire::negotiation_message_key(2, forged))
            .await
            .unwrap();

        let stage3 = attacker.recv().await.unwrap();
        wire::parse_message_key(&stage3, 3).unwrap();
    };

    let (result, ()) = tokio::join!(
        responder.run(&mut b_conn, &bob, None, &Message::Null),
        relay
    );
    assert!(matches!(result, Err(ProtocolError::InvalidNonce)));
    assert_eq!(responder.state(), NegotiationState::Failed);
}

// ============================================================================
// Secure channel
// ============================================================================

/// Packets arrive in send order, once each, over a slow duplicating link.
#[tokio::test]
async fn test_channel_ordering_under_duplication() {
    let network = MemoryNetwork::with_conditions(
        LinkConditions::new(Duration::from_millis(5), 0.1).with_seed(42),
    );
    let (a_conn, b_conn) = network.link("Aalice", "Abob");
    let sender = SecureChannel::new(a_conn, shared_key(), ChannelConfig::default());
    let (_tx, mut stream) =
        SecureChannel::new(b_conn, shared_key(), ChannelConfig::default()).into_stream();

    const COUNT: u64 = 200;
    for n in 0..COUNT {
        sender
            .send(&PacketData::new("seq", Message::Integer(n.into())))
            .await
            .unwrap();
    }

    for expected in 0..COUNT {
        match tokio::time::timeout(DELIVERY_TIMEOUT, stream.next()).await {
            Ok(Some(ChannelEvent::Data(packet))) => {
                let n: u64 = packet.content.as_integer().unwrap().try_into().unwrap();
                assert_eq!(n, expected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

/// Fresh IVs for every packet.
#[tokio::test]
async fn test_iv_uniqueness() {
    let (a_conn, _b_conn) = MemoryNetwork::new().link("Aalice", "Abob");
    let channel = SecureChannel::new(a_conn, shared_key(), ChannelConfig::default());

    let packet = PacketData::new("message", Message::Text("same text".into()));
    let mut ivs = HashSet::new();
    for _ in 0..10_000 {
        assert!(ivs.insert(channel.encrypt(&packet).unwrap().iv));
    }
}

/// A channel keyed differently yields decryption errors, then closes.
#[tokio::test]
async fn test_mismatched_keys_close_channel() {
    let (a_conn, b_conn) = MemoryNetwork::new().link("Aalice", "Abob");
    let sender = SecureChannel::new(a_conn, shared_key(), ChannelConfig::default());
    let other_key = SessionKey::from_shared_secret(&[0x01; 32]).unwrap();
    let (_tx, mut stream) =
        SecureChannel::new(b_conn, other_key, ChannelConfig::default()).into_stream();

    for _ in 0..3 {
        sender
            .send(&PacketData::new("message", Message::Text("hi".into())))
            .await
            .unwrap();
    }

    let mut errors = 0;
    while let Some(event) = stream.next().await {
        match event {
            ChannelEvent::Error(ProtocolError::Decryption(_)) => errors += 1,
            ChannelEvent::Closed => break,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(errors, 3);
}

// ============================================================================
// Connection manager
// ============================================================================

/// Chat over a 50 ms, 1 % duplicating link arrives complete and in order.
#[tokio::test]
async fn test_manager_chat_over_slow_link() {
    let fixture = TwoPeerFixture::with_conditions(
        LinkConditions::new(Duration::from_millis(50), 0.01).with_seed(1),
        NodeConfig::default(),
    )
    .unwrap();
    let (to_bob, to_alice) = fixture.connect().await.unwrap();

    assert_eq!(to_bob.session_fingerprint, to_alice.session_fingerprint);
    assert_eq!(to_bob.username, "bob");
    assert_eq!(to_alice.username, "alice");
    assert!(to_bob.first_contact);
    assert_eq!(fixture.alice.contacts.len(), 1);
    assert_eq!(fixture.bob.contacts.len(), 1);

    const COUNT: usize = 50;
    for n in 0..COUNT {
        send_message(&to_bob.sender, &fixture.alice.log, &format!("line {n}"))
            .await
            .unwrap();
    }
    tokio::time::timeout(DELIVERY_TIMEOUT, fixture.bob.log.wait_for_len(COUNT))
        .await
        .unwrap();

    let received = fixture.bob.log.messages();
    assert_eq!(received.len(), COUNT);
    for (n, message) in received.iter().enumerate() {
        assert_eq!(message.text, format!("line {n}"));
        assert_eq!(message.peer, fixture.alice.id());
    }
}

/// A second connection uses the stored contact instead of first contact.
#[tokio::test]
async fn test_reconnect_uses_known_contact() {
    let fixture = TwoPeerFixture::new().unwrap();
    let (to_bob, to_alice) = fixture.connect().await.unwrap();
    assert!(to_bob.first_contact);

    fixture.alice.manager.disconnect(fixture.bob.id()).await;
    to_bob.closed().await;
    tokio::time::timeout(DELIVERY_TIMEOUT, to_alice.closed())
        .await
        .unwrap();

    let (again, _) = fixture.connect().await.unwrap();
    assert!(!again.first_contact);
    assert!(again.generation > to_bob.generation);
    assert_ne!(again.session_fingerprint, to_bob.session_fingerprint);
}

/// Disconnecting removes the registry entry on both sides.
#[tokio::test]
async fn test_disconnect_clears_registry() {
    let fixture = TwoPeerFixture::new().unwrap();
    let (to_bob, to_alice) = fixture.connect().await.unwrap();
    assert!(fixture.alice.manager.sender(fixture.bob.id()).is_some());

    assert!(fixture.alice.manager.disconnect(fixture.bob.id()).await);
    to_bob.closed().await;
    tokio::time::timeout(DELIVERY_TIMEOUT, to_alice.closed())
        .await
        .unwrap();

    assert!(fixture.alice.manager.registry().is_empty());
    assert!(fixture.bob.manager.registry().is_empty());
    assert!(!fixture.alice.manager.disconnect(fixture.bob.id()).await);
}

/// A dialer that hangs up before negotiating does not stop the acceptor.
#[tokio::test]
async fn test_acceptor_survives_hung_up_dial() {
    let fixture = TwoPeerFixture::new().unwrap();
    let acceptor = fixture.bob.manager.spawn_acceptor();

    let stranger = fixture.network.endpoint("Astranger");
    let dial = stranger.connect(fixture.bob.id()).await.unwrap();
    dial.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!acceptor.is_finished());

    let to_bob = tokio::time::timeout(
        DELIVERY_TIMEOUT,
        fixture.alice.manager.connect(fixture.bob.id()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(to_bob.id(), fixture.bob.id());
    assert!(!acceptor.is_finished());

    acceptor.abort();
}

/// A dialer that never speaks does not hold up the next inbound peer.
#[tokio::test]
async fn test_silent_dialer_does_not_block_acceptor() {
    let fixture = TwoPeerFixture::new().unwrap();
    let acceptor = fixture.bob.manager.spawn_acceptor();

    let stranger = fixture.network.endpoint("Astranger");
    let _silent = stranger.connect(fixture.bob.id()).await.unwrap();

    let to_bob = tokio::time::timeout(
        DELIVERY_TIMEOUT,
        fixture.alice.manager.connect(fixture.bob.id()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(to_bob.id(), fixture.bob.id());

    let registered = async {
        while fixture.bob.manager.sender(fixture.alice.id()).is_none() {
            tokio::task::yield_now().await;
        }
    };
    tokio::time::timeout(DELIVERY_TIMEOUT, registered)
        .await
        .unwrap();

    acceptor.abort();
}

/// Simultaneous dials leave one usable entry per side.
#[tokio::test]
async fn test_simultaneous_connect() {
    let fixture = TwoPeerFixture::new().unwrap();
    let alice_acceptor = fixture.alice.manager.spawn_acceptor();
    let bob_acceptor = fixture.bob.manager.spawn_acceptor();

    let (a, b) = tokio::join!(
        fixture.alice.manager.connect(fixture.bob.id()),
        fixture.bob.manager.connect(fixture.alice.id()),
    );
    a.unwrap();
    b.unwrap();

    // Each side also accepted the other's dial.
    let settled = async {
        while fixture.alice.contacts.is_empty() || fixture.bob.contacts.is_empty() {
            tokio::task::yield_now().await;
        }
    };
    tokio::time::timeout(DELIVERY_TIMEOUT, settled).await.unwrap();

    assert_eq!(fixture.alice.manager.registry().len(), 1);
    assert_eq!(fixture.bob.manager.registry().len(), 1);

    let sender = fixture.alice.manager.sender(fixture.bob.id()).unwrap();
    send_message(&sender, &fixture.alice.log, "who won?")
        .await
        .unwrap();
    tokio::time::timeout(DELIVERY_TIMEOUT, fixture.bob.log.wait_for_len(1))
        .await
        .unwrap();
    assert_eq!(fixture.bob.log.messages()[0].text, "who won?");

    alice_acceptor.abort();
    bob_acceptor.abort();
}
