//! Segment tree integration tests: ordering, bounds, and the blocking
//! producer/consumer contract.

use caligo::net::{DataAckMetadata, Metadata, SegmentTree, TreeError, DATA};
use caligo::Segment;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

fn data_segment(seq: u32, payload: &[u8]) -> Segment {
    Segment::new(
        Metadata::DataAck(DataAckMetadata {
            protocol: DATA,
            session_id: 1,
            seq,
            un_ack_seq: 0,
            window_size: 0,
            prefix_len: 0,
            payload_len: payload.len() as u16,
            suffix_len: 0,
        }),
        payload.to_vec(),
    )
}

#[test]
fn insert_full_returns_segment_and_does_not_mutate() {
    let tree = SegmentTree::new(3);
    for seq in [2u32, 4, 6] {
        assert!(tree.insert(data_segment(seq, b"x")).is_ok());
    }
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.remaining(), 0);

    let rejected = tree.insert(data_segment(8, b"y")).unwrap_err();
    assert_eq!(rejected.seq(), 8);
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.min_seq(), Ok(2));
    assert_eq!(tree.max_seq(), Ok(6));
}

#[test]
fn ascend_enumerates_non_decreasing() {
    let tree = SegmentTree::new(64);
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let seq: u32 = rng.gen_range(0..1000);
        let _ = tree.insert(data_segment(seq, b""));
    }
    let mut prev: Option<u32> = None;
    tree.ascend(|s| {
        if let Some(p) = prev {
            assert!(p <= s.seq());
        }
        prev = Some(s.seq());
        true
    });
}

#[test]
fn delete_min_if_only_fires_on_predicate() {
    let tree = SegmentTree::new(8);
    tree.insert(data_segment(5, b"")).unwrap();
    assert!(tree.delete_min_if(|s| s.seq() < 5).is_none());
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.delete_min_if(|s| s.seq() < 6).unwrap().seq(), 5);
    assert_eq!(tree.min_seq(), Err(TreeError::Empty));
}

#[tokio::test]
async fn blocking_producer_consumer_strict_order() {
    // Producer inserts seq 0..99 with randomized sub-10ms delays; consumer
    // drains with DeleteMinBlocking and must observe 0..99 in order.
    let tree = Arc::new(SegmentTree::new(8));

    let producer = {
        let tree = tree.clone();
        tokio::spawn(async move {
            for seq in 0..100u32 {
                let delay = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0..10)
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                tree.insert_blocking(data_segment(seq, b"payload")).await;
            }
        })
    };

    let consumer = {
        let tree = tree.clone();
        tokio::spawn(async move {
            let mut observed = Vec::with_capacity(100);
            for _ in 0..100 {
                observed.push(tree.delete_min_blocking().await.seq());
            }
            observed
        })
    };

    tokio::time::timeout(Duration::from_secs(30), producer)
        .await
        .expect("producer timed out")
        .unwrap();
    let observed = tokio::time::timeout(Duration::from_secs(30), consumer)
        .await
        .expect("consumer timed out")
        .unwrap();

    let expected: Vec<u32> = (0..100).collect();
    assert_eq!(observed, expected);
}

#[tokio::test]
async fn insert_blocking_wakes_deterministically() {
    let tree = Arc::new(SegmentTree::new(1));
    tree.insert(data_segment(0, b"")).unwrap();

    let blocked = {
        let tree = tree.clone();
        tokio::spawn(async move {
            tree.insert_blocking(data_segment(1, b"")).await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "insert must block while full");

    assert_eq!(tree.delete_min().unwrap().seq(), 0);
    tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("insert did not unblock after delete_min")
        .unwrap();
    assert_eq!(tree.len(), 1);
}
