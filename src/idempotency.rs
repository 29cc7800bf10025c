use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

fn namespaced(company_id: &str, key: &str) -> String {
    format!("pim-sync:idem:{company_id}:{key}")
}

pub async fn redis_get<T: DeserializeOwned>(
    client: &redis::Client,
    company_id: &str,
    key: &str,
) -> Option<T> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn
        .get::<_, Option<String>>(namespaced(company_id, key))
        .await
        .ok()
        .flatten();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set<T: Serialize>(
    client: &redis::Client,
    company_id: &str,
    key: &str,
    value: &T,
    ttl_secs: u64,
) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(namespaced(company_id, key), json, ttl_secs).await;
    }
}

/// In-process fallback used when no redis is configured. Entries older than
/// the TTL read as absent and are purged on the next insert.
pub struct MemoryReplay<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> MemoryReplay<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, company_id: &str, key: &str) -> Option<T> {
        let guard = self.entries.lock().await;
        guard
            .get(&namespaced(company_id, key))
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, value)| value.clone())
    }

    pub async fn set(&self, company_id: &str, key: &str, value: T) {
        let mut guard = self.entries.lock().await;
        let ttl = self.ttl;
        guard.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        guard.insert(namespaced(company_id, key), (Instant::now(), value));
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_entries_expire_and_are_purged() {
        let replay = MemoryReplay::new(Duration::from_millis(40));
        replay.set("acme", "k1", 7u32).await;
        assert_eq!(replay.get("acme", "k1").await, Some(7));
        assert_eq!(replay.get("globex", "k1").await, None);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(replay.get("acme", "k1").await, None);

        replay.set("acme", "k2", 8).await;
        assert_eq!(replay.len().await, 1);
        assert_eq!(replay.get("acme", "k2").await, Some(8));
    }

    #[test]
    fn keys_are_scoped_per_company() {
        assert_ne!(namespaced("acme", "k1"), namespaced("globex", "k1"));
        assert_eq!(namespaced("acme", "k1"), "pim-sync:idem:acme:k1");
    }
}
