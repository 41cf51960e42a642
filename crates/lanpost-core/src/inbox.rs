// SPDX-License-Identifier: AGPL-3.0
// Lanpost Core - Inbox
//
// Append-only ordered store of sent and received messages. The engine is
// the single writer; frontends read snapshots. A message is only appended
// after the transport acknowledged it (outbound) or after it decoded
// cleanly (inbound), so the inbox never holds a partial message.

use crate::types::Message;
use std::sync::RwLock;

/// Shared append-only message store
#[derive(Default)]
pub struct Inbox {
    messages: RwLock<Vec<Message>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one message, preserving arrival order
    pub fn append(&self, message: Message) {
        self.messages.write().unwrap().push(message);
    }

    /// Consistent point-in-time copy of all messages, in arrival order
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.read().unwrap().clone()
    }

    /// Case-insensitive substring search over message content.
    /// An empty query matches everything.
    pub fn filter(&self, query: &str) -> Vec<Message> {
        let needle = query.to_lowercase();
        self.messages
            .read()
            .unwrap()
            .iter()
            .filter(|m| needle.is_empty() || m.content.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Number of stored messages
    pub fn len(&self) -> usize {
        self.messages.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let inbox = Inbox::new();
        for i in 0..5 {
            inbox.append(Message::new("A", format!("msg {}", i)));
        }

        let snapshot = inbox.snapshot();
        assert_eq!(snapshot.len(), 5);
        for (i, m) in snapshot.iter().enumerate() {
            assert_eq!(m.content, format!("msg {}", i));
        }
    }

    #[test]
    fn test_filter_case_insensitive_substring() {
        let inbox = Inbox::new();
        inbox.append(Message::new("A", "hello"));
        inbox.append(Message::new("B", "world"));

        let hits = inbox.filter("HEL");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "hello");
    }

    #[test]
    fn test_empty_query_matches_all() {
        let inbox = Inbox::new();
        inbox.append(Message::new("A", "hello"));
        inbox.append(Message::new("B", "world"));
        assert_eq!(inbox.filter("").len(), 2);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let inbox = Inbox::new();
        inbox.append(Message::new("A", "one"));

        let snapshot = inbox.snapshot();
        inbox.append(Message::new("A", "two"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(inbox.len(), 2);
    }

    #[test]
    fn test_concurrent_append_and_snapshot() {
        use std::sync::Arc;

        let inbox = Arc::new(Inbox::new());
        let writer = {
            let inbox = inbox.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    inbox.append(Message::new("W", format!("{}", i)));
                }
            })
        };

        let reader = {
            let inbox = inbox.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let snap = inbox.snapshot();
                    // Snapshots observe a prefix of the appends, never a hole
                    for (i, m) in snap.iter().enumerate() {
                        assert_eq!(m.content, format!("{}", i));
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(inbox.len(), 200);
    }
}
