//! Per-channel bounded cache of recent messages.
//!
//! Edit, delete and pin events only carry the new state; the cache supplies
//! the "before" side. Each channel keeps at most `capacity` messages and
//! evicts the oldest insertion first.

use std::collections::{HashMap, VecDeque};

use cordirc_platform::{Message, Snowflake};
use parking_lot::Mutex;

#[derive(Default)]
struct ChannelCache {
    order: VecDeque<Snowflake>,
    messages: HashMap<Snowflake, Message>,
}

impl ChannelCache {
    fn put(&mut self, message: Message, capacity: usize) {
        let id = message.id;
        if self.messages.insert(id, message).is_none() {
            self.order.push_back(id);
            while self.order.len() > capacity {
                if let Some(old) = self.order.pop_front() {
                    self.messages.remove(&old);
                }
            }
        }
    }
}

pub struct MessageCache {
    capacity: usize,
    channels: Mutex<HashMap<Snowflake, ChannelCache>>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Store a message, overwriting any earlier copy with the same id.
    pub fn insert(&self, message: Message) {
        let mut channels = self.channels.lock();
        channels
            .entry(message.channel_id)
            .or_default()
            .put(message, self.capacity);
    }

    /// Store a message only when it is not cached yet.
    ///
    /// Returns false when a copy was already present.
    pub fn insert_if_absent(&self, message: Message) -> bool {
        let mut channels = self.channels.lock();
        let cache = channels.entry(message.channel_id).or_default();
        if cache.messages.contains_key(&message.id) {
            return false;
        }
        cache.put(message, self.capacity);
        true
    }

    pub fn get(&self, channel: Snowflake, message: Snowflake) -> Option<Message> {
        self.channels
            .lock()
            .get(&channel)
            .and_then(|c| c.messages.get(&message))
            .cloned()
    }

    /// Forget everything cached for a channel.
    pub fn drop_channel(&self, channel: Snowflake) {
        self.channels.lock().remove(&channel);
    }

    pub fn len(&self, channel: Snowflake) -> usize {
        self.channels
            .lock()
            .get(&channel)
            .map_or(0, |c| c.messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cordirc_platform::User;

    fn msg(channel: u64, id: u64, content: &str) -> Message {
        Message {
            id: Snowflake(id),
            channel_id: Snowflake(channel),
            guild_id: None,
            author: User {
                id: Snowflake(1),
                username: "alice".into(),
                discriminator: None,
                global_name: None,
                bot: false,
            },
            content: content.to_string(),
            timestamp: Utc::now(),
            edited_timestamp: None,
            pinned: false,
            mentions: vec![],
            attachments: vec![],
        }
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let cache = MessageCache::new(10);
        cache.insert(msg(1, 5, "old"));
        cache.insert(msg(1, 5, "new"));
        assert_eq!(cache.len(Snowflake(1)), 1);
        assert_eq!(cache.get(Snowflake(1), Snowflake(5)).unwrap().content, "new");
    }

    #[test]
    fn oldest_insertion_is_evicted_per_channel() {
        let cache = MessageCache::new(2);
        cache.insert(msg(1, 1, "a"));
        cache.insert(msg(1, 2, "b"));
        cache.insert(msg(2, 9, "other channel"));
        cache.insert(msg(1, 3, "c"));
        assert!(cache.get(Snowflake(1), Snowflake(1)).is_none());
        assert!(cache.get(Snowflake(1), Snowflake(3)).is_some());
        assert!(cache.get(Snowflake(2), Snowflake(9)).is_some());
    }

    #[test]
    fn insert_if_absent_does_not_clobber_live_copy() {
        let cache = MessageCache::new(10);
        cache.insert(msg(1, 5, "edited live"));
        assert!(!cache.insert_if_absent(msg(1, 5, "stale history")));
        assert_eq!(cache.get(Snowflake(1), Snowflake(5)).unwrap().content, "edited live");
        assert!(cache.insert_if_absent(msg(1, 6, "fresh")));
    }

    #[test]
    fn missing_entries_are_none() {
        let cache = MessageCache::new(10);
        assert!(cache.get(Snowflake(1), Snowflake(1)).is_none());
        cache.insert(msg(1, 1, "x"));
        cache.drop_channel(Snowflake(1));
        assert!(cache.get(Snowflake(1), Snowflake(1)).is_none());
    }
}
