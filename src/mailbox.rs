use crate::envelope::Envelope;

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct Inner {
    mails: Vec<Envelope>,
    subscribers: Vec<mpsc::UnboundedSender<Envelope>>,
}

/// In-memory store of delivered mail, shared by every server session.
///
/// Appending and notifying happen under one lock, so a subscriber that calls
/// `snapshot()` after being notified always sees the envelope it was told about.
#[derive(Clone, Default)]
pub struct Mailbox {
    inner: Arc<Mutex<Inner>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an independent copy of `envelope` and notifies subscribers.
    pub fn deliver(&self, envelope: &Envelope) {
        let mail = envelope.clone();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.mails.push(mail.clone());
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(mail.clone()).is_ok());
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .push(tx);
        rx
    }

    pub fn snapshot(&self) -> Vec<Envelope> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mails
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).mails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_delivery_in_snapshot() {
        let mailbox = Mailbox::new();
        let mut rx = mailbox.subscribe();

        let envelope = Envelope::new("a@b.com", "c@d.com", "hi", "hello");
        mailbox.deliver(&envelope);

        let notified = rx.recv().await.unwrap();
        assert_eq!(notified, envelope);
        assert_eq!(mailbox.snapshot(), vec![envelope]);
    }

    #[test]
    fn delivered_copy_is_independent_of_sender() {
        let mailbox = Mailbox::new();
        let mut envelope = Envelope::new("a@b.com", "c@d.com", "hi", "hello");
        mailbox.deliver(&envelope);

        envelope.body.push_str(" world");
        assert_eq!(mailbox.snapshot()[0].body, "hello");
    }

    #[test]
    fn dropped_subscribers_are_forgotten() {
        let mailbox = Mailbox::new();
        drop(mailbox.subscribe());
        mailbox.deliver(&Envelope::default());
        assert_eq!(mailbox.len(), 1);
        assert!(mailbox.inner.lock().unwrap().subscribers.is_empty());
    }
}
