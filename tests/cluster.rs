mod common;

use std::time::Duration;

use common::{peer, previous_value, set, wait_until, Cluster};
use raftd::raft::NodeState;
use raftd::util::errors::RaftError;

#[actix_rt::test]
async fn test_single_leader_elected() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;

    let leader = cluster.node("node-1").state().await;
    for node in &cluster.nodes {
        let id = node.id.clone();
        let term = leader.current_term;
        wait_until(&format!("{} to follow node-1", id), move || async move {
            let info = node.state().await;
            info.current_term == term && info.current_leader.as_deref() == Some("node-1")
        })
        .await;
    }

    assert_eq!(cluster.leaders().await, vec!["node-1".to_string()]);
    assert!(leader.current_term >= 1);
}

#[actix_rt::test]
async fn test_commands_replicate_to_every_node() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;
    let leader = &cluster.node("node-1").handle;

    let first = leader.submit_and_wait(set("color", "red")).await.unwrap();
    assert_eq!(previous_value(&first.result), None);
    let second = leader.submit_and_wait(set("color", "blue")).await.unwrap();
    assert_eq!(previous_value(&second.result), Some("red".to_string()));
    assert_eq!(second.index, first.index + 1);

    for node in &cluster.nodes {
        let index = second.index;
        wait_until(&format!("{} to apply {}", node.id, index), move || async move {
            node.state().await.last_applied >= index
        })
        .await;
        assert_eq!(node.store.get("color"), Some("blue".to_string()));
    }
}

#[actix_rt::test]
async fn test_follower_redirects_to_leader() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;

    let follower = cluster.node("node-2");
    wait_until("node-2 to learn the leader", move || async move {
        follower.state().await.current_leader.is_some()
    })
    .await;

    let info = follower.state().await;
    assert_eq!(info.leader_address(), Some("mem://node-1"));
    match follower.handle.submit(set("k", "v")).await {
        Err(RaftError::NotLeader { leader }) => assert_eq!(leader.as_deref(), Some("node-1")),
        other => panic!("expected NotLeader, got {:?}", other),
    }
}

#[actix_rt::test]
async fn test_isolated_leader_is_replaced() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;
    let old = cluster.node("node-1");
    let first = old.handle.submit_and_wait(set("a", "1")).await.unwrap();
    let old_term = old.state().await.current_term;
    let first_index = first.index;
    for node in &cluster.nodes {
        wait_until("every node to apply the first write", move || async move {
            node.state().await.last_applied >= first_index
        })
        .await;
    }

    cluster.network.isolate("node-1");

    // Accepted by the cut-off leader but never committed
    let (index, term) = old.handle.submit(set("a", "lost")).await.unwrap();
    let handle = old.handle.clone();
    let lost = actix::spawn(async move { handle.wait_applied(index, term).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(old.state().await.commit_index < index);

    cluster.elect("node-2").await;
    let new_leader = &cluster.node("node-2").handle;
    assert!(new_leader.state().await.unwrap().current_term > old_term);
    new_leader.submit_and_wait(set("a", "2")).await.unwrap();

    cluster.network.heal();
    wait_until("node-1 to step down", move || async move {
        let info = old.state().await;
        info.state == NodeState::Follower && info.current_leader.as_deref() == Some("node-2")
    })
    .await;

    match lost.await.unwrap() {
        Err(RaftError::CommandLost { index: i, term: t }) => {
            assert_eq!((i, t), (index, term));
        }
        other => panic!("expected CommandLost, got {:?}", other),
    }

    wait_until("node-1 to catch up", move || async move {
        old.store.get("a") == Some("2".to_string())
    })
    .await;
    assert_eq!(cluster.leaders().await, vec!["node-2".to_string()]);
}

#[actix_rt::test]
async fn test_minority_cannot_elect() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;
    cluster.network.isolate("node-3");

    let lonely = cluster.node("node-3");
    lonely.expire_timer().await;
    wait_until("node-3 to campaign", move || async move {
        lonely.state().await.state == NodeState::Candidate
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(lonely.state().await.state, NodeState::Candidate);
    assert_eq!(cluster.leaders().await, vec!["node-1".to_string()]);
}

#[actix_rt::test]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let cluster = Cluster::with_compaction(3, 5);
    cluster.elect("node-1").await;
    let leader = &cluster.node("node-1").handle;

    cluster.network.isolate("node-3");
    let mut last = 0;
    for i in 0..20 {
        let applied = leader
            .submit_and_wait(set(&format!("key-{}", i), &i.to_string()))
            .await
            .unwrap();
        last = applied.index;
    }

    let info = leader.state().await.unwrap();
    assert!(info.first_log_index > 1, "leader should have compacted its log");

    cluster.network.heal();
    let follower = cluster.node("node-3");
    wait_until("node-3 to catch up", move || async move {
        follower.state().await.last_applied >= last
    })
    .await;

    assert_eq!(follower.store.entries(), cluster.node("node-1").store.entries());
    assert_eq!(follower.store.len(), 20);
}

#[actix_rt::test]
async fn test_new_node_joins_cluster() {
    let mut cluster = Cluster::start(3);
    cluster.elect("node-1").await;
    cluster
        .node("node-1")
        .handle
        .submit_and_wait(set("before", "join"))
        .await
        .unwrap();

    let members = vec![peer("node-1"), peer("node-2"), peer("node-3")];
    cluster.add_node("node-4", members);
    let joiner = cluster.node("node-4");
    assert!(!joiner.state().await.voter);

    let leader = &cluster.node("node-1").handle;
    leader.add_peer(peer("node-4")).await.unwrap();
    assert!(leader
        .state()
        .await
        .unwrap()
        .peers
        .iter()
        .any(|p| p.id == "node-4"));

    wait_until("node-4 to become a voter", move || async move {
        joiner.state().await.voter
    })
    .await;

    leader.submit_and_wait(set("after", "join")).await.unwrap();
    wait_until("node-4 to apply", move || async move {
        joiner.store.get("after").is_some()
    })
    .await;
    assert_eq!(joiner.store.get("before"), Some("join".to_string()));
}

#[actix_rt::test]
async fn test_removed_peer_no_longer_counts() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;
    let leader = &cluster.node("node-1").handle;

    leader.remove_peer("node-3".to_string()).await.unwrap();
    let info = leader.state().await.unwrap();
    assert!(info.peers.iter().all(|p| p.id != "node-3"));

    // Two members left; node-1 and node-2 are a majority
    cluster.network.isolate("node-3");
    leader.submit_and_wait(set("k", "v")).await.unwrap();

    // node-1 alone is not
    cluster.network.isolate("node-2");
    let (index, _) = leader.submit(set("k", "w")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(leader.state().await.unwrap().commit_index < index);
}

#[actix_rt::test]
async fn test_single_node_commits_alone() {
    let cluster = Cluster::start(1);
    cluster.elect("node-1").await;

    let applied = cluster
        .node("node-1")
        .handle
        .submit_and_wait(set("solo", "yes"))
        .await
        .unwrap();
    assert_eq!(previous_value(&applied.result), None);
    assert_eq!(cluster.node("node-1").store.get("solo"), Some("yes".to_string()));
}

#[actix_rt::test]
async fn test_truncated_commands_fail_their_waiters() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;
    let old = cluster.node("node-1");
    let first = old.handle.submit_and_wait(set("a", "1")).await.unwrap();
    let first_index = first.index;
    for node in &cluster.nodes {
        wait_until("every node to apply the first write", move || async move {
            node.state().await.last_applied >= first_index
        })
        .await;
    }

    cluster.network.isolate("node-1");
    let mut pending = Vec::new();
    for i in 0..3 {
        let (index, term) = old.handle.submit(set("b", &i.to_string())).await.unwrap();
        let handle = old.handle.clone();
        let waiter = actix::spawn(async move { handle.wait_applied(index, term).await });
        pending.push((index, term, waiter));
    }

    // The new leader only holds its no-op past the shared prefix
    cluster.elect("node-2").await;
    cluster.network.heal();

    for (index, term, waiter) in pending {
        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap_or_else(|_| panic!("waiter for {} never resolved", index))
            .unwrap();
        match outcome {
            Err(RaftError::CommandLost { index: i, term: t }) => assert_eq!((i, t), (index, term)),
            other => panic!("expected CommandLost for {}, got {:?}", index, other),
        }
    }
    assert_eq!(old.store.get("b"), None);
}

#[actix_rt::test]
async fn test_cut_link_only_delays_that_follower() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;
    cluster.network.cut("node-1", "node-3");

    let leader = &cluster.node("node-1").handle;
    leader.submit_and_wait(set("k", "v")).await.unwrap();
    let follower = cluster.node("node-2");
    wait_until("node-2 to apply", move || async move {
        follower.store.get("k") == Some("v".to_string())
    })
    .await;
    let lagging = cluster.node("node-3");
    assert_eq!(lagging.store.get("k"), None);

    cluster.network.heal();
    wait_until("node-3 to catch up", move || async move {
        lagging.store.get("k") == Some("v".to_string())
    })
    .await;
    assert_eq!(cluster.leaders().await, vec!["node-1".to_string()]);
}

#[actix_rt::test]
async fn test_second_membership_change_waits_for_first() {
    let cluster = Cluster::start(3);
    cluster.elect("node-1").await;
    let leader = &cluster.node("node-1").handle;
    leader.submit_and_wait(set("before", "change")).await.unwrap();

    cluster.network.isolate("node-1");
    let handle = leader.clone();
    let first = actix::spawn(async move { handle.add_peer(peer("node-4")).await });
    let node = cluster.node("node-1");
    wait_until("the add to be appended", move || async move {
        let info = node.state().await;
        info.last_log_index > info.commit_index
    })
    .await;

    match leader.remove_peer("node-3".to_string()).await {
        Err(RaftError::MembershipChangePending(index)) => {
            assert_eq!(index, leader.state().await.unwrap().last_log_index);
        }
        other => panic!("expected MembershipChangePending, got {:?}", other),
    }
    // Ordinary commands are still accepted
    leader.submit(set("k", "v")).await.unwrap();

    cluster.network.heal();
    first.await.unwrap().unwrap();
    leader.remove_peer("node-4".to_string()).await.unwrap();
    let info = leader.state().await.unwrap();
    assert!(info.peers.iter().all(|p| p.id != "node-4"));
}
