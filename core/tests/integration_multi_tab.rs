//! Leader election between tabs sharing one broadcast channel

use pairwire_core::coordinator::{
    BroadcastChannel, CoordinatorConfig, CoordinatorState, LocalBroadcast, TabBody,
    TabCoordinator, TabHandlers, TabMessage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn open_tab(channel: &LocalBroadcast, elected: Arc<AtomicUsize>) -> TabCoordinator {
    TabCoordinator::start(
        Arc::new(channel.clone()),
        CoordinatorConfig::default(),
        TabHandlers {
            on_elected: Some(Arc::new(move || {
                elected.fetch_add(1, Ordering::SeqCst);
            })),
            ..TabHandlers::default()
        },
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_two_tabs_converge_and_hand_over() {
    let channel = LocalBroadcast::default();
    let elections = Arc::new(AtomicUsize::new(0));
    let first = open_tab(&channel, elections.clone());
    let second = open_tab(&channel, elections.clone());

    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut states = vec![first.state(), second.state()];
    states.sort_by_key(|state| *state == CoordinatorState::Leader);
    assert_eq!(states, vec![CoordinatorState::Follower, CoordinatorState::Leader]);

    let (leader, follower) = if first.is_leader() {
        (first, second)
    } else {
        (second, first)
    };
    let before = elections.load(Ordering::SeqCst);

    leader.unload();
    assert_eq!(leader.state(), CoordinatorState::NoLeader);

    tokio::time::timeout(
        Duration::from_secs(10),
        follower.wait_for(CoordinatorState::Leader),
    )
    .await
    .expect("follower never took over")
    .unwrap();
    assert!(follower.is_leader());
    assert_eq!(elections.load(Ordering::SeqCst), before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_tab_follows_existing_leader() {
    let channel = LocalBroadcast::default();
    let elections = Arc::new(AtomicUsize::new(0));
    let leader = open_tab(&channel, elections.clone());
    leader.wait_for(CoordinatorState::Leader).await.unwrap();

    let late = open_tab(&channel, elections.clone());
    late.wait_for(CoordinatorState::Follower).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(leader.is_leader());
    assert_eq!(late.state(), CoordinatorState::Follower);
    assert_eq!(leader.followers(), vec![late.id().to_string()]);
    assert_eq!(elections.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hand_over_survives_closed_follower() {
    // The nominee is picked at random, so repeat until both picks are likely covered
    for _ in 0..10 {
        let channel = LocalBroadcast::default();
        let elections = Arc::new(AtomicUsize::new(0));
        let leader = open_tab(&channel, elections.clone());
        leader.wait_for(CoordinatorState::Leader).await.unwrap();
        let follower = open_tab(&channel, elections.clone());
        follower.wait_for(CoordinatorState::Follower).await.unwrap();

        // A tab that joined and then vanished without ChildUnload
        channel
            .post(TabMessage::broadcast("closed-tab", TabBody::RequestLeadership))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(leader.followers().len(), 2);

        leader.unload();
        tokio::time::timeout(
            Duration::from_secs(30),
            follower.wait_for(CoordinatorState::Leader),
        )
        .await
        .expect("no tab took over")
        .unwrap();
        assert_eq!(elections.load(Ordering::SeqCst), 2);
    }
}
