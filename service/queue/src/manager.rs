//! Registry of named queues over one shared store client.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;

use tributary_context::Context;

use crate::backend::QueueBackend;
use crate::backend::RedisBackend;
use crate::config::QueueConf;
use crate::error::UnknownQueue;
use crate::queue::Queue;
use crate::queue::QueueStats;

/// Store a [`QueueManager`] builds queue backends against.
#[derive(Clone)]
enum Store {
    Redis(redis::aio::ConnectionManager),
    #[cfg(any(test, feature = "test-fixture"))]
    Memory,
}

/// Registry of named queues over one shared store client.
///
/// Queues are created once and cached; a queue's mode is fixed by the first
/// `create` call for its name.
#[derive(Clone)]
pub struct QueueManager {
    queues: Arc<Mutex<HashMap<String, Queue>>>,
    store: Store,
}

impl QueueManager {
    /// Connect the manager to a redis class store.
    pub async fn redis(url: &str) -> Result<QueueManager> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(QueueManager {
            queues: Arc::new(Mutex::new(HashMap::new())),
            store: Store::Redis(connection),
        })
    }

    /// Manager over in-process queues, for unit tests.
    #[cfg(any(test, feature = "test-fixture"))]
    pub fn memory() -> QueueManager {
        QueueManager {
            queues: Arc::new(Mutex::new(HashMap::new())),
            store: Store::Memory,
        }
    }

    /// Create a queue with the given definition, or return the cached handle.
    pub fn create(&self, conf: QueueConf) -> Queue {
        let mut queues = self.queues.lock().expect("queue registry poisoned");
        if let Some(queue) = queues.get(&conf.name) {
            return queue.clone();
        }
        let backend: Arc<dyn QueueBackend> = match &self.store {
            Store::Redis(connection) => {
                Arc::new(RedisBackend::new(connection.clone(), conf.clone()))
            }
            #[cfg(any(test, feature = "test-fixture"))]
            Store::Memory => Arc::new(crate::backend::MemoryBackend::new(conf.clone())),
        };
        let queue = Queue::new(conf.clone(), backend);
        queues.insert(conf.name.clone(), queue.clone());
        queue
    }

    /// Fetch the handle for an existing queue.
    pub fn get(&self, name: &str) -> Result<Queue> {
        let queues = self.queues.lock().expect("queue registry poisoned");
        queues
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownQueue::new(name).into())
    }

    /// Names of all queues created through this manager.
    pub fn names(&self) -> Vec<String> {
        let queues = self.queues.lock().expect("queue registry poisoned");
        queues.keys().cloned().collect()
    }

    /// Statistics for every queue created through this manager.
    pub async fn stats_all(&self, context: &Context) -> Result<HashMap<String, QueueStats>> {
        let queues: Vec<Queue> = {
            let queues = self.queues.lock().expect("queue registry poisoned");
            queues.values().cloned().collect()
        };
        let mut stats = HashMap::new();
        for queue in queues {
            let name = queue.conf().name.clone();
            stats.insert(name, queue.stats(context).await?);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use tributary_context::Context;

    use super::QueueManager;
    use crate::config::QueueConf;
    use crate::config::QueueMode;
    use crate::error::UnknownQueue;

    #[tokio::test]
    async fn create_caches_by_name() {
        let manager = QueueManager::memory();
        let first = manager.create(QueueConf::new("events", QueueMode::Fifo));
        // A second create with a different mode returns the original queue.
        let second = manager.create(QueueConf::new("events", QueueMode::Priority));
        assert_eq!(second.conf().mode, QueueMode::Fifo);
        assert_eq!(first.conf().name, second.conf().name);
    }

    #[tokio::test]
    async fn get_unknown_queue_errors() {
        let manager = QueueManager::memory();
        let error = manager.get("missing").unwrap_err();
        assert!(error.is::<UnknownQueue>());
    }

    #[tokio::test]
    async fn stats_cover_all_queues() {
        let context = Context::fixture();
        let manager = QueueManager::memory();
        manager.create(QueueConf::new("a", QueueMode::Fifo));
        manager.create(QueueConf::new("b", QueueMode::Priority));
        let stats = manager.stats_all(&context).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.contains_key("a"));
        assert!(stats.contains_key("b"));
    }
}
