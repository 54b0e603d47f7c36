use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{NestError, Result},
    index::SkipList,
};

/// Bounded FIFO depth per subscriber. Delivery never blocks: when a queue
/// is full the event is dropped for that subscriber only.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One queued event: the kind plus its serialized payload.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub kind: EventKind,
    pub data: String,
}

/// A live stream reader. Owned exclusively by the hub; the resource tree
/// never references subscribers, and subscribers hold resource paths as
/// strings, never tree nodes.
#[derive(Clone)]
struct Subscriber {
    sender: mpsc::Sender<EventFrame>,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct SubscriberSet {
    resource: String,
    entries: Arc<SkipList<String, Subscriber>>,
}

/// Maps resource paths to their subscriber sets and fans events out to
/// every subscriber on an ancestor-or-equal path. Both mapping levels are
/// ordered indexes: resource -> set, and token -> subscriber within a set.
#[derive(Default)]
pub struct SubscriptionHub {
    resources: SkipList<String, SubscriberSet>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently ensure a subscriber set exists for `resource`.
    pub fn subscribe_path(&self, resource: &str) -> Result<()> {
        self.resources
            .upsert(resource.to_string(), |key, current| match current {
                Some(existing) => Ok(existing.clone()),
                None => Ok(SubscriberSet {
                    resource: key.clone(),
                    entries: Arc::new(SkipList::new()),
                }),
            })?;
        Ok(())
    }

    /// Register a subscriber under `token`. Fails when the resource was
    /// never subscribed or the token is already taken there. Returns the
    /// queue's receiving end.
    pub fn add_subscription(
        &self,
        resource: &str,
        token: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EventFrame>> {
        let set = self
            .resources
            .find(&resource.to_string())
            .ok_or_else(|| NestError::BadRequest("resource is not subscribed".into()))?;

        let (sender, receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let subscriber = Subscriber { sender, cancel };
        set.entries.upsert(token.to_string(), |key, current| {
            if current.is_some() {
                return Err(NestError::Conflict(format!("subscription {key}")));
            }
            Ok(subscriber.clone())
        })?;
        Ok(receiver)
    }

    /// Remove and close one subscriber.
    pub fn delete_subscription(&self, resource: &str, token: &str) -> Result<()> {
        let set = self
            .resources
            .find(&resource.to_string())
            .ok_or_else(|| NestError::BadRequest("resource is not subscribed".into()))?;
        let subscriber = set
            .entries
            .remove(&token.to_string())
            .ok_or_else(|| NestError::BadRequest("subscription does not exist".into()))?;
        subscriber.cancel.cancel();
        Ok(())
    }

    /// Deliver `kind`/`data` to every subscriber whose resource is an
    /// ancestor-or-equal prefix of `changed` in the alternating tree.
    pub fn notify(&self, changed: &str, kind: EventKind, data: &str) {
        for prefix in resource_prefixes(changed) {
            self.dispatch(&prefix, kind, data);
        }
    }

    /// Deletion fan-out. Subscribers on strict ancestors of `removed` get
    /// one `delete` event and stay live; subscribers on `removed` or any
    /// descendant get one `delete` event (payload from `data_for` applied
    /// to their own resource) and then their set is dropped, closing the
    /// queues.
    pub fn notify_removed(&self, removed: &str, data_for: impl Fn(&str) -> String) {
        let prefixes = resource_prefixes(removed);
        let deleted_data = data_for(removed);
        for prefix in &prefixes[..prefixes.len().saturating_sub(1)] {
            self.dispatch(prefix, EventKind::Delete, &deleted_data);
        }

        let cancel = CancellationToken::new();
        let Ok(sets) = self.resources.query(&cancel, None, None) else {
            return;
        };
        let subtree = format!("{removed}/");
        for set in sets {
            if set.resource != removed && !set.resource.starts_with(&subtree) {
                continue;
            }
            if let Ok(subscribers) = set.entries.query(&cancel, None, None) {
                let data = data_for(&set.resource);
                for subscriber in subscribers {
                    push(&subscriber, &set.resource, EventKind::Delete, &data);
                    subscriber.cancel.cancel();
                }
            }
            self.resources.remove(&set.resource);
        }
    }

    fn dispatch(&self, resource: &str, kind: EventKind, data: &str) {
        let Some(set) = self.resources.find(&resource.to_string()) else {
            debug!(resource, "no subscription on this path");
            return;
        };
        let subscribers = match set.entries.query(&CancellationToken::new(), None, None) {
            Ok(subscribers) => subscribers,
            Err(err) => {
                warn!(resource, %err, "failed to query path subscriptions");
                return;
            }
        };
        for subscriber in subscribers {
            push(&subscriber, resource, kind, data);
        }
    }
}

fn push(subscriber: &Subscriber, resource: &str, kind: EventKind, data: &str) {
    let frame = EventFrame {
        kind,
        data: data.to_string(),
    };
    match subscriber.sender.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(resource, "subscriber queue full; dropping event");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Every prefix of `path` names a valid resource in the alternating tree:
/// `a/b/c` yields `a`, `a/b`, `a/b/c`.
fn resource_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut built = String::new();
    for segment in path.split('/') {
        if !built.is_empty() {
            built.push('/');
        }
        built.push_str(segment);
        prefixes.push(built.clone());
    }
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe(hub: &SubscriptionHub, resource: &str, token: &str) -> mpsc::Receiver<EventFrame> {
        hub.subscribe_path(resource).unwrap();
        hub.add_subscription(resource, token, CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn prefixes_cover_every_level() {
        assert_eq!(
            resource_prefixes("db/doc/col/nested"),
            vec!["db", "db/doc", "db/doc/col", "db/doc/col/nested"]
        );
    }

    #[tokio::test]
    async fn subscribe_path_is_idempotent() {
        let hub = SubscriptionHub::new();
        hub.subscribe_path("db").unwrap();
        hub.subscribe_path("db").unwrap();

        let mut rx = hub
            .add_subscription("db", "tok", CancellationToken::new())
            .unwrap();
        hub.notify("db/doc", EventKind::Update, "{}");
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Update);
    }

    #[tokio::test]
    async fn duplicate_tokens_are_rejected_per_resource() {
        let hub = SubscriptionHub::new();
        let _rx = subscribe(&hub, "db", "tok");
        let err = hub
            .add_subscription("db", "tok", CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, NestError::Conflict(_)));

        // The same token under a different resource is fine.
        hub.subscribe_path("other").unwrap();
        hub.add_subscription("other", "tok", CancellationToken::new())
            .unwrap();
    }

    #[tokio::test]
    async fn add_requires_subscribed_path() {
        let hub = SubscriptionHub::new();
        let err = hub
            .add_subscription("nowhere", "tok", CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, NestError::BadRequest(_)));
    }

    #[tokio::test]
    async fn notify_reaches_ancestors_and_self_only() {
        let hub = SubscriptionHub::new();
        let mut db_rx = subscribe(&hub, "db", "t1");
        let mut doc_rx = subscribe(&hub, "db/doc", "t2");
        let mut col_rx = subscribe(&hub, "db/doc/col", "t3");
        let mut other_rx = subscribe(&hub, "other", "t4");

        hub.notify("db/doc", EventKind::Update, r#"{"path":"/v1/db/doc"}"#);

        assert_eq!(db_rx.recv().await.unwrap().data, r#"{"path":"/v1/db/doc"}"#);
        assert_eq!(doc_rx.recv().await.unwrap().kind, EventKind::Update);
        assert!(col_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_arrive_in_push_order() {
        let hub = SubscriptionHub::new();
        let mut rx = subscribe(&hub, "db", "tok");
        for i in 0..5 {
            hub.notify("db", EventKind::Update, &format!("{i}"));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().data, format!("{i}"));
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let hub = SubscriptionHub::new();
        let mut rx = subscribe(&hub, "db", "tok");
        for i in 0..EVENT_QUEUE_CAPACITY + 10 {
            hub.notify("db", EventKind::Update, &format!("{i}"));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, EVENT_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn subtree_removal_closes_descendant_queues_once() {
        let hub = SubscriptionHub::new();
        let mut above_rx = subscribe(&hub, "db", "t1");
        let mut at_rx = subscribe(&hub, "db/doc", "t2");
        let mut below_rx = subscribe(&hub, "db/doc/col", "t3");
        let mut sibling_rx = subscribe(&hub, "db/other", "t4");

        hub.notify_removed("db/doc", |resource| format!("\"/v1/{resource}\""));

        // Ancestor: one delete, queue stays open.
        let frame = above_rx.recv().await.unwrap();
        assert_eq!(frame.kind, EventKind::Delete);
        assert_eq!(frame.data, "\"/v1/db/doc\"");
        assert!(above_rx.try_recv().is_err());

        // At the removed path: one delete, then closed.
        let frame = at_rx.recv().await.unwrap();
        assert_eq!(frame.data, "\"/v1/db/doc\"");
        assert!(at_rx.recv().await.is_none());

        // Below: one delete for its own prefix, then closed.
        let frame = below_rx.recv().await.unwrap();
        assert_eq!(frame.data, "\"/v1/db/doc/col\"");
        assert!(below_rx.recv().await.is_none());

        // Unrelated sibling is untouched.
        assert!(sibling_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_subscription_closes_the_stream() {
        let hub = SubscriptionHub::new();
        let mut rx = subscribe(&hub, "db", "tok");
        hub.delete_subscription("db", "tok").unwrap();
        assert!(rx.recv().await.is_none());

        hub.notify("db", EventKind::Update, "{}");
        assert!(rx.try_recv().is_err());
    }
}
