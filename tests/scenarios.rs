//! End-to-end scenarios against the public API, one per numbered case.

use std::net::Ipv4Addr;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use mainline_overlay::bep5_client::Bep5Client;
use mainline_overlay::id::Id;
use mainline_overlay::mainline::MainlineDht;
use mainline_overlay::mutable_item::MutableItem;
use mainline_overlay::node::NodeContact;
use mainline_overlay::routing_table::{NullPingSink, RoutingTable};

async fn local_dht(bootstrap: Vec<String>) -> MainlineDht {
    MainlineDht::bind(&["127.0.0.1:0".parse().unwrap()], bootstrap)
        .await
        .unwrap()
}

/// 1. A node bootstrapped with an observed WAN address derives a node id
/// that satisfies the BEP42 constraint for that address.
#[test]
fn scenario_1_bep42_derived_id_is_valid_for_observed_ip() {
    let observed = Ipv4Addr::new(203, 0, 113, 5);
    let id = Id::from_ip(observed, 7);
    assert!(id.is_valid_for_ip(observed));
    assert!(!id.is_valid_for_ip(Ipv4Addr::new(198, 51, 100, 9)));
}

/// 2. Insert 100 contacts with random ids (so, starting from a single
/// bucket, every one of them initially maps to the near/self bucket); the
/// near bucket must split repeatedly as it fills, and `find_closest` must
/// still return exactly the true 8 closest among whatever ended up kept.
#[test]
fn scenario_2_bucket_splits_and_keeps_8_closest() {
    let self_id = Id::from_bytes([0u8; 20]);
    let mut table = RoutingTable::new(self_id, Box::new(NullPingSink));

    for i in 0..100u16 {
        let id = Id::random();
        let endpoint = format!("127.0.0.1:{}", 20000 + i).parse().unwrap();
        table.try_add(NodeContact::new(id, endpoint), true);
    }

    assert!(table.bucket_count() > 1, "near bucket should have split");
    assert!(!table.is_empty());

    let known = table.dump();

    let closest = table.find_closest(self_id, 8);
    assert_eq!(closest.len(), 8.min(known.len()));

    let mut by_distance = known.clone();
    by_distance.sort_by_key(|c| self_id.distance(&c.id));
    let expected: Vec<Id> = by_distance.iter().take(closest.len()).map(|c| c.id).collect();
    let actual: Vec<Id> = closest.iter().map(|c| c.id).collect();
    assert_eq!(actual, expected);
}

/// 3. A mutable put at seq 1 succeeds; a second put at the same seq with a
/// different value is rejected (302) and the stored value is unchanged.
#[tokio::test]
async fn scenario_3_stale_mutable_put_is_rejected() {
    let dht = local_dht(vec![]).await;
    let signing_key = SigningKey::generate(&mut OsRng);

    let a = MutableItem::sign(&signing_key, None, b"A".to_vec(), 1);
    dht.mutable_put(a.clone(), None).await.unwrap();

    let b = MutableItem::sign(&signing_key, None, b"B".to_vec(), 1);
    let err = dht.mutable_put(b, None).await.unwrap_err();
    assert!(matches!(err, mainline_overlay::error::Error::SequenceNotUpdated));

    let stored = dht
        .mutable_get(signing_key.verifying_key().to_bytes(), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.value, a.value);

    dht.shutdown();
}

/// 4. An immutable put is addressed by `sha1(bencode(value))` and a
/// subsequent get returns the original value.
#[tokio::test]
async fn scenario_4_immutable_put_get_roundtrip() {
    let dht = local_dht(vec![]).await;

    let value = b"5:hello".to_vec();
    let target = dht.immutable_put(value.clone()).await.unwrap();
    assert_eq!(target, mainline_overlay::id::sha1(&value));

    let fetched = dht.immutable_get(target).await.unwrap().unwrap();
    assert_eq!(fetched, value);

    dht.shutdown();
}

/// 5. Node A announces infohash H; node B, bootstrapped only against A,
/// discovers A via get_peers, and B's own announce_peer to A succeeds.
#[tokio::test]
async fn scenario_5_announce_and_get_peers_across_two_nodes() {
    let node_a = local_dht(vec![]).await;
    let a_port = node_a.local_endpoints()[0].port();

    let node_b = local_dht(vec![format!("127.0.0.1:{}", a_port)]).await;

    // Let B's background bootstrap ping/find_node reach A, so A's routing
    // table has a seed to query when it announces below.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let infohash = Id::random();
    node_a.tracker_announce(infohash, Some(6881)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    // A announced port 6881 explicitly; the endpoint B's tracker records is
    // (A's observed source ip, 6881), not A's own bound UDP port.
    let expected: std::net::SocketAddr = "127.0.0.1:6881".parse().unwrap();
    let peers = node_b.tracker_get_peers(infohash).await.unwrap();
    assert!(peers.contains(&expected));

    node_b.tracker_announce(infohash, Some(6882)).await.unwrap();

    node_a.shutdown();
    node_b.shutdown();
}

/// 6. Bep5Client.connect races every known candidate and returns whichever
/// one is actually reachable, remembering it as `last_working_endpoint`.
#[tokio::test]
async fn scenario_6_connect_prefers_reachable_candidate() {
    let client_dht = local_dht(vec![]).await;
    let client_port = client_dht.local_endpoints()[0].port();
    let client = Bep5Client::new(client_dht, "test-injector", &[]);
    let injector_infohash = client.injector_infohash();
    assert_eq!(injector_infohash, MainlineDht::swarm_infohash("test-injector"));

    // Two separate peers, bootstrapped against the client's own node,
    // announce themselves on the injector swarm: one at a port nothing is
    // listening on, one at a real accepting listener.
    let bootstrap = vec![format!("127.0.0.1:{}", client_port)];

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let reachable = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let good_peer = local_dht(bootstrap.clone()).await;
    let bad_peer = local_dht(bootstrap).await;

    // Let both peers' background bootstrap (ping + find_node against the
    // client's node) land before they announce, so each has a seed to
    // query for the injector infohash's responsible nodes.
    tokio::time::sleep(Duration::from_millis(100)).await;

    good_peer
        .tracker_announce(injector_infohash, Some(reachable.port()))
        .await
        .unwrap();
    bad_peer
        .tracker_announce(injector_infohash, Some(1))
        .await
        .unwrap();

    // Let the injector swarm's background refresh loop pick both up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stream = client.connect().await.unwrap();
    assert_eq!(stream.peer_addr().unwrap(), reachable);
    assert_eq!(client.last_working_endpoint(), Some(reachable));

    good_peer.shutdown();
    bad_peer.shutdown();
}
