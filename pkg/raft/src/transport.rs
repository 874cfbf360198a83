//! The pub/sub transport is an external collaborator (§6): best-effort,
//! unordered delivery of opaque byte payloads to subjects, with an optional
//! reply-to subject per message. Only the trait lives here.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use crate::error::NodeError;

/// Invoked once per delivered message; `reply_to` is the subject the
/// sender wants a response published to, if any.
pub type MessageHandler = Arc<dyn Fn(&str, Option<&str>, Bytes) + Send + Sync>;

pub trait Subscription: Send + Sync {
    fn unsubscribe(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, subject: &str, reply_to: Option<&str>, payload: Bytes) -> Result<(), NodeError>;

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<Box<dyn Subscription>, NodeError>;

    /// Generates a fresh, collision-resistant private inbox subject, e.g.
    /// for a catchup session or a reply-to address (`$NRG.R.<random>`).
    fn new_inbox(&self) -> String {
        random_inbox_suffix(10)
    }
}

/// Base-62 suffix with enough entropy that concurrent catchups cannot
/// collide (§9: 8+ characters is sufficient; we use 10).
pub fn random_inbox_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn subject_vote(group: &str) -> String {
    format!("$NRG.V.{group}")
}

pub fn subject_append_entries(group: &str) -> String {
    format!("$NRG.AE.{group}")
}

pub fn subject_propose(group: &str) -> String {
    format!("$NRG.P.{group}")
}

pub fn subject_remove_peer_propose(group: &str) -> String {
    format!("$NRG.RP.{group}")
}

pub fn new_reply_inbox(transport: &dyn Transport) -> String {
    format!("$NRG.R.{}", transport.new_inbox())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_suffix_has_requested_length() {
        assert_eq!(random_inbox_suffix(8).len(), 8);
    }

    #[test]
    fn subjects_are_scoped_by_group() {
        assert_eq!(subject_vote("g1"), "$NRG.V.g1");
        assert_eq!(subject_append_entries("g1"), "$NRG.AE.g1");
    }
}
