use std::{sync::Arc, time::Duration};

use connector::{
    blocks::{subscribe_blocks, BlockEvent, BlockSubscriberSettings, MultiChainBlocks},
    pool::ConnectionPool,
    test_utils::MockFactory,
};
use connector_types::ChainKey;
use futures::StreamExt;
use utils::init_tracing_tests;

fn settings() -> BlockSubscriberSettings {
    BlockSubscriberSettings {
        poll_interval: Duration::from_secs(1),
        confirmation_lag: 0,
        ..Default::default()
    }
}

fn pool(factory: &Arc<MockFactory>, settings: BlockSubscriberSettings) -> ConnectionPool {
    ConnectionPool::new(factory.clone(), settings)
}

async fn next_event(blocks: &mut MultiChainBlocks) -> (ChainKey, BlockEvent) {
    tokio::time::timeout(Duration::from_secs(120), blocks.next())
        .await
        .expect("no block event in time")
        .expect("block stream ended")
}

async fn next_heights(blocks: &mut MultiChainBlocks, n: usize) -> Vec<u64> {
    let mut heights = Vec::with_capacity(n);
    while heights.len() < n {
        match next_event(blocks).await {
            (_, BlockEvent::Block(block)) => heights.push(block.header.number),
            (chain, event) => panic!("unexpected event on {chain}: {event:?}"),
        }
    }
    heights
}

/// Lets the subscriber task run its first poll
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn pushed_heads_are_delivered_in_order() {
    init_tracing_tests();

    let factory = Arc::new(MockFactory::default());
    let chain = ChainKey::eip155(5);
    let mock = factory.chain(&chain);
    let heads = factory.heads(&chain);
    mock.advance_to(5);

    let pool = pool(&factory, settings());
    let mut blocks = subscribe_blocks(&pool, &[chain.clone()]).unwrap();
    settle().await;

    mock.advance_to(10);
    heads.push(10);
    // stale and repeated heads change nothing
    heads.push(7);
    heads.push(10);

    assert_eq!(next_heights(&mut blocks, 5).await, vec![5, 6, 7, 8, 9]);

    mock.advance_to(12);
    heads.push(12);
    assert_eq!(next_heights(&mut blocks, 2).await, vec![10, 11]);

    // every height was fetched exactly once
    let fetches = mock.with_state(|state| state.block_fetches.clone());
    let mut deduped = fetches.clone();
    deduped.dedup();
    assert_eq!(fetches, deduped);
}

#[tokio::test(start_paused = true)]
async fn confirmation_lag_holds_back_blocks() {
    init_tracing_tests();

    let factory = Arc::new(MockFactory::default());
    let chain = ChainKey::eip155(5);
    let mock = factory.chain(&chain);
    mock.advance_to(100);

    let pool = pool(
        &factory,
        BlockSubscriberSettings {
            confirmation_lag: 3,
            ..settings()
        },
    );
    let mut blocks = subscribe_blocks(&pool, &[chain.clone()]).unwrap();
    settle().await;

    mock.advance_to(105);
    factory.heads(&chain).push(105);

    assert_eq!(next_heights(&mut blocks, 2).await, vec![100, 101]);
    let early = tokio::time::timeout(Duration::from_secs(5), blocks.next()).await;
    assert!(early.is_err(), "block 102 is within the lag");
}

#[tokio::test(start_paused = true)]
async fn polling_covers_a_silent_push_channel() {
    init_tracing_tests();

    let factory = Arc::new(MockFactory::default());
    let chain = ChainKey::eip155(5);
    let mock = factory.chain(&chain);
    let heads = factory.heads(&chain);
    mock.advance_to(1);

    let pool = pool(
        &factory,
        BlockSubscriberSettings {
            stalled_push_polls: 3,
            ..settings()
        },
    );
    let mut blocks = subscribe_blocks(&pool, &[chain.clone()]).unwrap();
    settle().await;

    for height in 2..=8 {
        mock.advance_to(height);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let heights = next_heights(&mut blocks, 5).await;
    assert!(heights.windows(2).all(|pair| pair[1] == pair[0] + 1));
    assert_eq!(heights[0], 1);
    assert!(heads.reconnects() >= 1);
}

#[tokio::test(start_paused = true)]
async fn far_behind_skips_to_the_head() {
    init_tracing_tests();

    let factory = Arc::new(MockFactory::default());
    let chain = ChainKey::eip155(5);
    let mock = factory.chain(&chain);
    let heads = factory.heads(&chain);
    mock.advance_to(1);

    let pool = pool(
        &factory,
        BlockSubscriberSettings {
            max_catchup_blocks: 5,
            ..settings()
        },
    );
    let mut blocks = subscribe_blocks(&pool, &[chain.clone()]).unwrap();
    settle().await;

    mock.advance_to(20);
    heads.push(20);

    match next_event(&mut blocks).await {
        (_, BlockEvent::Skipped { from, to }) => assert_eq!((from, to), (1, 19)),
        (_, event) => panic!("expected a skip, got {event:?}"),
    }

    mock.advance_to(21);
    heads.push(21);
    assert_eq!(next_heights(&mut blocks, 1).await, vec![20]);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_retried_without_reordering() {
    init_tracing_tests();

    let factory = Arc::new(MockFactory::default());
    let chain = ChainKey::eip155(5);
    let mock = factory.chain(&chain);
    mock.advance_to(2);

    let pool = pool(&factory, settings());
    let mut blocks = subscribe_blocks(&pool, &[chain.clone()]).unwrap();
    settle().await;

    mock.with_state(|state| {
        state.failing_blocks.insert(3);
    });
    mock.advance_to(6);
    factory.heads(&chain).push(6);

    assert_eq!(next_heights(&mut blocks, 1).await, vec![2]);

    // block 4 is never delivered before 3
    tokio::time::sleep(Duration::from_secs(3)).await;
    mock.with_state(|state| state.failing_blocks.clear());

    assert_eq!(next_heights(&mut blocks, 3).await, vec![3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_node_is_fatal() {
    init_tracing_tests();

    let factory = Arc::new(MockFactory::default());
    let chain = ChainKey::eip155(5);
    factory
        .chain(&chain)
        .with_state(|state| state.block_number_failures = 100);

    let pool = pool(&factory, settings());
    let mut blocks = subscribe_blocks(&pool, &[chain.clone()]).unwrap();

    match next_event(&mut blocks).await {
        (fatal_chain, BlockEvent::Fatal(reason)) => {
            assert_eq!(fatal_chain, chain);
            assert!(reason.contains("failed polls"), "{reason}");
        }
        (_, event) => panic!("expected fatal, got {event:?}"),
    }
    assert!(blocks.next().await.is_none());
    assert!(factory.heads(&chain).is_closed());

    // the closed connection is never handed out again
    drop(blocks);
    let fresh = pool.acquire(&chain).unwrap();
    assert!(!fresh.is_closed());
    assert_eq!(factory.opened(&chain), 2);
}

#[tokio::test(start_paused = true)]
async fn chains_are_merged_and_ordered_per_chain() {
    init_tracing_tests();

    let factory = Arc::new(MockFactory::default());
    let mainnet = ChainKey::eip155(1);
    let goerli = ChainKey::eip155(5);
    factory.chain(&mainnet).advance_to(100);
    factory.chain(&goerli).advance_to(7);

    let pool = pool(&factory, settings());
    let mut blocks = subscribe_blocks(&pool, &[mainnet.clone(), goerli.clone()]).unwrap();
    settle().await;
    assert_eq!(pool.ref_count(&mainnet), 1);

    factory.chain(&mainnet).advance_to(103);
    factory.heads(&mainnet).push(103);
    factory.chain(&goerli).advance_to(10);
    factory.heads(&goerli).push(10);

    let mut mainnet_heights = Vec::new();
    let mut goerli_heights = Vec::new();
    while mainnet_heights.len() + goerli_heights.len() < 6 {
        match next_event(&mut blocks).await {
            (chain, BlockEvent::Block(block)) if chain == mainnet => {
                mainnet_heights.push(block.header.number)
            }
            (chain, BlockEvent::Block(block)) if chain == goerli => {
                goerli_heights.push(block.header.number)
            }
            (chain, event) => panic!("unexpected event on {chain}: {event:?}"),
        }
    }

    assert_eq!(mainnet_heights, vec![100, 101, 102]);
    assert_eq!(goerli_heights, vec![7, 8, 9]);

    // dropping the stream releases both connections
    drop(blocks);
    assert_eq!(pool.ref_count(&mainnet), 0);
    assert_eq!(pool.ref_count(&goerli), 0);
}
