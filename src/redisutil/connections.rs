//! Keyed pool of administrative connections, one per node address.
//!
//! Every entry sits behind its own lock. A command holds that lock for its whole
//! round-trip, so [`AdminConnections::remove`] can wait for an in-flight command
//! to finish and then close the entry. Once `remove` returns, nothing else can
//! be sent to that node through this pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

/// Shared handle to one pooled connection; `None` once it has been removed.
pub type ConnectionHandle<C> = Arc<Mutex<Option<C>>>;

/// Thread-safe map of `ip:port` to connection.
pub struct AdminConnections<C> {
    conns: RwLock<HashMap<String, ConnectionHandle<C>>>,
}

impl<C> Default for AdminConnections<C> {
    fn default() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Send> AdminConnections<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; an existing entry for `addr` is kept and `false` returned.
    pub async fn add(&self, addr: impl Into<String>, conn: C) -> bool {
        let mut conns = self.conns.write().await;
        let addr = addr.into();
        if conns.contains_key(&addr) {
            return false;
        }
        conns.insert(addr, Arc::new(Mutex::new(Some(conn))));
        true
    }

    pub async fn get(&self, addr: &str) -> Option<ConnectionHandle<C>> {
        self.conns.read().await.get(addr).cloned()
    }

    pub async fn contains(&self, addr: &str) -> bool {
        self.conns.read().await.contains_key(addr)
    }

    /// Unlink `addr` and wait for its in-flight command to drain.
    ///
    /// Returns the closed connection, or `None` if `addr` was not pooled.
    pub async fn remove(&self, addr: &str) -> Option<C> {
        let handle = self.conns.write().await.remove(addr)?;
        let mut slot = handle.lock().await;
        slot.take()
    }

    /// Unlink `addr` if it still maps to `handle`; a newer connection is left alone.
    pub async fn evict(&self, addr: &str, handle: &ConnectionHandle<C>) -> bool {
        let mut conns = self.conns.write().await;
        match conns.get(addr) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                conns.remove(addr);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry whose address is not in `keep`; returns the removed addresses.
    pub async fn retain(&self, keep: &[String]) -> Vec<String> {
        let stale: Vec<String> = self
            .conns
            .read()
            .await
            .keys()
            .filter(|addr| !keep.contains(addr))
            .cloned()
            .collect();
        for addr in &stale {
            self.remove(addr).await;
        }
        stale
    }

    /// Pooled addresses, sorted.
    pub async fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.conns.read().await.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_add_get_remove() {
        let pool: AdminConnections<u32> = AdminConnections::new();
        assert!(pool.add("10.0.0.1:6379", 1).await);
        assert!(!pool.add("10.0.0.1:6379", 2).await);
        assert!(pool.add("10.0.0.2:6379", 3).await);

        let handle = pool.get("10.0.0.1:6379").await.unwrap();
        assert_eq!(*handle.lock().await, Some(1));
        assert_eq!(pool.addresses().await, vec!["10.0.0.1:6379", "10.0.0.2:6379"]);

        assert_eq!(pool.remove("10.0.0.1:6379").await, Some(1));
        assert_eq!(pool.remove("10.0.0.1:6379").await, None);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_handle_is_closed_after_remove() {
        let pool: AdminConnections<u32> = AdminConnections::new();
        pool.add("10.0.0.1:6379", 7).await;
        let handle = pool.get("10.0.0.1:6379").await.unwrap();

        pool.remove("10.0.0.1:6379").await;
        assert!(handle.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_waits_for_in_flight_command() {
        let pool: Arc<AdminConnections<u32>> = Arc::new(AdminConnections::new());
        pool.add("10.0.0.1:6379", 1).await;

        let handle = pool.get("10.0.0.1:6379").await.unwrap();
        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let in_flight = tokio::spawn(async move {
            let mut guard = handle.lock().await;
            locked_tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let Some(conn) = guard.as_mut() {
                *conn += 1;
            }
        });
        locked_rx.await.unwrap();

        let start = tokio::time::Instant::now();
        let removed = pool.remove("10.0.0.1:6379").await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(removed, Some(2));
        in_flight.await.unwrap();
    }

    #[tokio::test]
    async fn test_evict_skips_replaced_entry() {
        let pool: AdminConnections<u32> = AdminConnections::new();
        pool.add("10.0.0.1:6379", 1).await;
        let old = pool.get("10.0.0.1:6379").await.unwrap();

        assert!(pool.evict("10.0.0.1:6379", &old).await);
        assert!(!pool.contains("10.0.0.1:6379").await);

        pool.add("10.0.0.1:6379", 2).await;
        assert!(!pool.evict("10.0.0.1:6379", &old).await);
        assert!(pool.contains("10.0.0.1:6379").await);
    }

    #[tokio::test]
    async fn test_retain_prunes_stale_addresses() {
        let pool: AdminConnections<u32> = AdminConnections::new();
        pool.add("a:1", 1).await;
        pool.add("b:1", 2).await;
        pool.add("c:1", 3).await;

        let removed = pool.retain(&["b:1".to_string()]).await;
        assert_eq!(removed.len(), 2);
        assert_eq!(pool.addresses().await, vec!["b:1"]);
    }
}
