//! Shared fixtures for integration tests
//!
//! A "node" is one manager plus its running invalidation listener. Several
//! nodes over one `InMemoryRemoteStore` stand in for several processes.

#![allow(dead_code)]

use multilevel_cache::{
    CircuitBreaker, InMemoryRemoteStore, InvalidationListener, MultiLevelCacheConfig,
    MultiLevelCacheManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Node {
    pub manager: Arc<MultiLevelCacheManager>,
    pub listener: InvalidationListener,
    task: JoinHandle<()>,
}

pub fn manager(
    config: MultiLevelCacheConfig,
    remote: Arc<InMemoryRemoteStore>,
) -> Arc<MultiLevelCacheManager> {
    let breaker = Arc::new(CircuitBreaker::new("remote", config.circuit_breaker.clone()));
    Arc::new(MultiLevelCacheManager::new(config, remote, breaker).unwrap())
}

/// Start `count` nodes over `remote`, returning once every listener is subscribed
pub async fn cluster(
    count: usize,
    config: &MultiLevelCacheConfig,
    remote: &Arc<InMemoryRemoteStore>,
    shutdown: &CancellationToken,
) -> Vec<Node> {
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let manager = manager(config.clone(), remote.clone());
        let listener = InvalidationListener::new(manager.clone());
        let task = listener.spawn(remote.clone(), config.topic.clone(), shutdown.clone());
        nodes.push(Node {
            manager,
            listener,
            task,
        });
    }

    for node in &nodes {
        let listener = node.listener.clone();
        eventually(move || listener.subscription_count() > 0).await;
    }
    nodes
}

/// Cancel the listeners and wait for their tasks
pub async fn shutdown(nodes: Vec<Node>, token: CancellationToken) {
    token.cancel();
    for node in nodes {
        node.task.await.unwrap();
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
