use crate::message::Message;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    stored_at: Instant,
}

/// Replies keyed by correlation id.
///
/// Written by one subscription loop, read by any number of waiting callers.
/// Reads are non-destructive; entries leave only through
/// [`evict_older_than`](Self::evict_older_than) or [`remove`](Self::remove).
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: DashMap<String, Entry>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. A redelivered reply refreshes its age. Returns
    /// `true` when an entry was replaced.
    pub fn upsert(&self, correlation_id: impl Into<String>, message: Message) -> bool {
        self.entries
            .insert(
                correlation_id.into(),
                Entry {
                    message,
                    stored_at: Instant::now(),
                },
            )
            .is_some()
    }

    pub fn get(&self, correlation_id: &str) -> Option<Message> {
        self.entries
            .get(correlation_id)
            .map(|entry| entry.message.clone())
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    pub fn remove(&self, correlation_id: &str) -> Option<Message> {
        self.entries
            .remove(correlation_id)
            .map(|(_, entry)| entry.message)
    }

    /// Drop entries stored more than `max_age` ago; returns how many went.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) <= max_age);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn reply(body: &str) -> Message {
        Message {
            id: format!("id-{body}"),
            receipt_handle: String::new(),
            body: body.into(),
            attributes: HashMap::new(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let table = CorrelationTable::new();
        assert!(!table.upsert("c1", reply("first")));
        assert!(table.upsert("c1", reply("second")));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("c1").unwrap().body, "second");
    }

    #[test]
    fn get_is_non_destructive_and_remove_is() {
        let table = CorrelationTable::new();
        table.upsert("c1", reply("x"));
        assert!(table.get("c1").is_some());
        assert!(table.contains("c1"));
        assert_eq!(table.remove("c1").unwrap().body, "x");
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_only_entries_past_max_age() {
        let table = CorrelationTable::new();
        table.upsert("old", reply("old"));
        tokio::time::advance(Duration::from_secs(15)).await;
        table.upsert("fresh", reply("fresh"));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(table.evict_older_than(Duration::from_secs(20)), 1);
        assert!(table.get("old").is_none());
        assert!(table.get("fresh").is_some());
    }

    #[test]
    fn concurrent_readers_see_writes() {
        let table = std::sync::Arc::new(CorrelationTable::new());
        let writer = {
            let table = table.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    table.upsert(format!("c{i}"), reply(&i.to_string()));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let mut seen = 0;
                    for i in 0..500 {
                        if table.get(&format!("c{i}")).is_some() {
                            seen += 1;
                        }
                    }
                    seen
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            assert!(reader.join().unwrap() <= 500);
        }
        assert_eq!(table.len(), 500);
    }
}
