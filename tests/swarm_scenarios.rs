use std::time::Duration;

use blockswarm::conf::{ChokeConf, Config, WireConf};
use blockswarm::descriptor::Descriptor;
use blockswarm::swarm::Swarm;

fn source_file(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// Tightened timing so a two-peer exchange completes well inside a test's
/// deadline instead of waiting out the crate's real-world choke cadence.
fn fast_config() -> Config {
    Config {
        choke: ChokeConf {
            regular_interval: Duration::from_millis(100),
            optimistic_interval: Duration::from_millis(300),
            ..ChokeConf::default()
        },
        wire: WireConf {
            request_min_interval: Duration::from_millis(20),
            ..WireConf::default()
        },
        ..Config::default()
    }
}

/// Peer A owns the whole file; peer B starts empty and is told about A's
/// address up front. B's assembled file must match A's source bytes within
/// the scenario's timeout.
#[tokio::test]
async fn two_peer_seed_to_leech() {
    let bytes = source_file(64);
    let descriptor = Descriptor::from_bytes("movie.bin".into(), &bytes, 16);

    let seed_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();

    // Seed the source bytes directly onto A's disk layout so A starts complete.
    let layout = blockswarm::BlockLayout::new(&descriptor, seed_dir.path());
    for index in 0..descriptor.block_count() {
        let start = index * 16;
        let end = std::cmp::min(start + 16, bytes.len());
        std::fs::write(layout.block_path(index), &bytes[start..end]).unwrap();
    }

    let seed_id = [7u8; 20];
    let seed_addr: std::net::SocketAddr = "127.0.0.1:19381".parse().unwrap();
    let seed_config = Config {
        client_id: seed_id,
        listen_addr: seed_addr,
        ..fast_config()
    };
    let seed = Swarm::new(seed_config, descriptor.clone(), seed_dir.path(), None)
        .await
        .unwrap();

    let leech_config = Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..fast_config()
    };
    let leech = Swarm::new(leech_config, descriptor, leech_dir.path(), None)
        .await
        .unwrap();
    leech.add_peer(seed_id, seed_addr).await;

    // The seed already owns every block, so its own run loop assembles and
    // returns almost immediately; its accept loop keeps running in the
    // background task `run()` spawned, independent of the `Swarm` value.
    let _ = tokio::spawn(seed.run());

    let result = tokio::time::timeout(Duration::from_secs(10), leech.run()).await;
    assert!(result.is_ok(), "leech did not finish downloading in time");
    result.unwrap().unwrap();

    let assembled = std::fs::read(leech_dir.path().join("movie.bin")).unwrap();
    assert_eq!(assembled, bytes);
}

/// A fresh 4-block file splits and reassembles back to its original bytes,
/// exercising the round-trip law from the component level rather than over
/// the wire.
#[tokio::test]
async fn descriptor_round_trip_matches_source_bytes() {
    let bytes = source_file(64);
    let descriptor = Descriptor::from_bytes("movie.bin".into(), &bytes, 16);
    assert_eq!(descriptor.block_count(), 4);

    let dir = tempfile::tempdir().unwrap();
    let layout = blockswarm::BlockLayout::new(&descriptor, dir.path());
    let store = blockswarm::BlockStoreHandle::spawn(std::sync::Arc::new(descriptor.clone()), layout.clone()).unwrap();

    for index in 0..descriptor.block_count() {
        let start = index * 16;
        let end = std::cmp::min(start + 16, bytes.len());
        store.insert(index, bytes[start..end].to_vec()).await.unwrap();
    }

    assert!(store.is_complete().await);
    store.assemble().await.unwrap();
    let assembled = std::fs::read(layout.assembled_path(&descriptor.name)).unwrap();
    assert_eq!(assembled, bytes);
}

/// Last block shorter than the configured block length: no padding is
/// introduced and the assembled file matches the source exactly.
#[tokio::test]
async fn uneven_last_block_round_trips_without_padding() {
    let bytes = source_file(70);
    let descriptor = Descriptor::from_bytes("movie.bin".into(), &bytes, 16);
    assert_eq!(descriptor.block_count(), 5);
    assert_eq!(descriptor.block_len_at(4), 6);

    let dir = tempfile::tempdir().unwrap();
    let layout = blockswarm::BlockLayout::new(&descriptor, dir.path());
    let store = blockswarm::BlockStoreHandle::spawn(std::sync::Arc::new(descriptor.clone()), layout.clone()).unwrap();

    for index in 0..descriptor.block_count() {
        let len = descriptor.block_len_at(index) as usize;
        let start = index * 16;
        store.insert(index, bytes[start..start + len].to_vec()).await.unwrap();
    }

    store.assemble().await.unwrap();
    let assembled = std::fs::read(layout.assembled_path(&descriptor.name)).unwrap();
    assert_eq!(assembled.len(), 70);
    assert_eq!(assembled, bytes);
}
