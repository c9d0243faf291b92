//! Per-query subscriptions and their callback registries.
//!
//! A [`Subscription`] represents one registered live query: its wire
//! identity (the request id), the query definition, a typed callback
//! registry and a confirmation state machine. Subscriptions are created by
//! [`LiveQueryClient::subscribe`](crate::LiveQueryClient::subscribe) and
//! handed back to the application as `Arc`s; the client keeps them indexed
//! by request id for dispatch.
//!
//! Callback dispatch happens on the event-queue consumer, never on the
//! frame reader. A panicking callback is caught at the dispatch boundary,
//! logged, and re-emitted through the same subscription's error callbacks,
//! so one broken callback cannot break delivery to the others.

use crate::error::LiveQueryError;
use crate::events::{Event, EventKind};
use crate::protocol::{ClientMessage, SubscribeQuery};
use crate::queue::describe_panic;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Generator for process-unique subscription request ids.
///
/// Uniqueness must hold across every client in the process, not just one:
/// two clients sharing a server connection pool must never collide. The
/// default is the process-wide [`shared`](Self::shared) instance; tests
/// and embedders that need isolated id spaces can inject their own via the
/// client builder.
#[derive(Debug)]
pub struct RequestIdSequence {
    next: AtomicU64,
}

impl RequestIdSequence {
    /// A sequence starting at 1.
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// The process-wide shared sequence.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<RequestIdSequence>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Produce the next id. Never repeats within this sequence.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Sent (or waiting to be sent); not yet confirmed by the server.
    Pending,
    /// Confirmed by the server; events are flowing.
    Subscribed,
    /// Cancelled by the application.
    Unsubscribed,
    /// Rejected by the server. Terminal; create a new subscription to retry.
    Error,
}

/// Callback receiving change events.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;
/// Callback fired on subscribe/unsubscribe confirmation.
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;
/// Callback receiving subscription-scoped errors.
pub type ErrorCallback = Arc<dyn Fn(&LiveQueryError) + Send + Sync>;

/// Typed per-kind callback collections.
///
/// A closed set of event kinds means a closed set of registries; there is
/// no string-keyed map to typo a kind into.
#[derive(Default)]
struct CallbackRegistry {
    create: Vec<EventCallback>,
    update: Vec<EventCallback>,
    delete: Vec<EventCallback>,
    enter: Vec<EventCallback>,
    leave: Vec<EventCallback>,
    subscribed: Vec<LifecycleCallback>,
    unsubscribed: Vec<LifecycleCallback>,
    error: Vec<ErrorCallback>,
}

impl CallbackRegistry {
    fn for_kind(&self, kind: EventKind) -> &Vec<EventCallback> {
        match kind {
            EventKind::Create => &self.create,
            EventKind::Update => &self.update,
            EventKind::Delete => &self.delete,
            EventKind::Enter => &self.enter,
            EventKind::Leave => &self.leave,
        }
    }

    fn for_kind_mut(&mut self, kind: EventKind) -> &mut Vec<EventCallback> {
        match kind {
            EventKind::Create => &mut self.create,
            EventKind::Update => &mut self.update,
            EventKind::Delete => &mut self.delete,
            EventKind::Enter => &mut self.enter,
            EventKind::Leave => &mut self.leave,
        }
    }
}

/// Hook a subscription uses to reach back into its owning client.
///
/// Implemented by the client's internals; a trait keeps the dependency
/// one-directional and lets subscription unit tests run detached.
pub(crate) trait SubscriptionTransport: Send + Sync {
    /// Ask the client to send the unsubscribe message and deregister.
    fn request_unsubscribe(&self, request_id: u64);
}

/// One registered live query.
pub struct Subscription {
    request_id: u64,
    class_name: String,
    filter: JsonValue,
    fields: Option<Vec<String>>,
    session_token: Option<String>,
    state: Mutex<SubscriptionState>,
    callbacks: Mutex<CallbackRegistry>,
    transport: Weak<dyn SubscriptionTransport>,
}

impl Subscription {
    pub(crate) fn new(
        transport: Weak<dyn SubscriptionTransport>,
        ids: &RequestIdSequence,
        class_name: impl Into<String>,
        filter: JsonValue,
        fields: Option<Vec<String>>,
        session_token: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request_id: ids.next_id(),
            class_name: class_name.into(),
            filter,
            fields,
            session_token,
            state: Mutex::new(SubscriptionState::Pending),
            callbacks: Mutex::new(CallbackRegistry::default()),
            transport,
        })
    }

    /// Subscription with no owning client, for unit tests.
    #[cfg(test)]
    pub(crate) fn detached(class_name: &str, filter: JsonValue) -> Arc<Self> {
        Self::new(
            Weak::<DetachedTransport>::new(),
            &RequestIdSequence::shared(),
            class_name,
            filter,
            None,
            None,
        )
    }

    /// Request id identifying this subscription on the wire.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Collection this subscription watches.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// `true` once the server confirmed the subscription.
    pub fn is_subscribed(&self) -> bool {
        self.state() == SubscriptionState::Subscribed
    }

    /// `true` while awaiting server confirmation.
    pub fn is_pending(&self) -> bool {
        self.state() == SubscriptionState::Pending
    }

    /// Register a callback for one event kind.
    pub fn on(&self, kind: EventKind, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.callbacks.lock().for_kind_mut(kind).push(Arc::new(callback));
        self
    }

    /// Register a callback for object creations.
    pub fn on_create(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventKind::Create, callback)
    }

    /// Register a callback for object updates.
    pub fn on_update(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventKind::Update, callback)
    }

    /// Register a callback for object deletions.
    pub fn on_delete(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventKind::Delete, callback)
    }

    /// Register a callback for objects entering the result set.
    pub fn on_enter(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventKind::Enter, callback)
    }

    /// Register a callback for objects leaving the result set.
    pub fn on_leave(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventKind::Leave, callback)
    }

    /// Register a callback fired when the server confirms the subscription.
    pub fn on_subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> &Self {
        self.callbacks.lock().subscribed.push(Arc::new(callback));
        self
    }

    /// Register a callback fired when the subscription is cancelled.
    pub fn on_unsubscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> &Self {
        self.callbacks.lock().unsubscribed.push(Arc::new(callback));
        self
    }

    /// Register a callback for subscription-scoped errors.
    pub fn on_error(&self, callback: impl Fn(&LiveQueryError) + Send + Sync + 'static) -> &Self {
        self.callbacks.lock().error.push(Arc::new(callback));
        self
    }

    /// Cancel this subscription.
    ///
    /// Sends the unsubscribe message (when connected) and removes the
    /// subscription from the client's registry. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.request_unsubscribe(self.request_id);
        } else {
            self.mark_unsubscribed();
        }
    }

    /// Wire payload registering this query.
    pub fn subscribe_message(&self) -> ClientMessage {
        ClientMessage::Subscribe {
            request_id: self.request_id,
            query: SubscribeQuery {
                class_name: self.class_name.clone(),
                filter: self.filter.clone(),
                fields: self.fields.clone(),
            },
            session_token: self.session_token.clone(),
        }
    }

    /// Wire payload cancelling this query.
    pub fn unsubscribe_message(&self) -> ClientMessage {
        ClientMessage::Unsubscribe { request_id: self.request_id }
    }

    /// Server confirmed the subscription. Idempotent: a duplicate
    /// confirmation after a resubscribe pass changes nothing.
    pub(crate) fn confirm(&self) {
        {
            let mut state = self.state.lock();
            if *state != SubscriptionState::Pending {
                return;
            }
            *state = SubscriptionState::Subscribed;
        }
        let callbacks = self.callbacks.lock().subscribed.clone();
        for callback in callbacks {
            self.guarded(|| callback());
        }
    }

    /// Server rejected the subscription, or delivery failed terminally.
    pub(crate) fn fail(&self, error: &LiveQueryError) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SubscriptionState::Unsubscribed | SubscriptionState::Error) {
                return;
            }
            *state = SubscriptionState::Error;
        }
        self.emit_error(error);
    }

    /// The application cancelled the subscription.
    pub(crate) fn mark_unsubscribed(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SubscriptionState::Unsubscribed | SubscriptionState::Error) {
                return;
            }
            *state = SubscriptionState::Unsubscribed;
        }
        let callbacks = self.callbacks.lock().unsubscribed.clone();
        for callback in callbacks {
            self.guarded(|| callback());
        }
    }

    /// Fan one event out to the callbacks registered for its kind.
    ///
    /// Runs on the queue consumer. Panics are converted to error events on
    /// this subscription; delivery to the remaining callbacks continues.
    pub(crate) fn handle_event(&self, event: &Event) {
        let callbacks = self.callbacks.lock().for_kind(event.kind()).clone();
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                let message = describe_panic(payload.as_ref());
                log::error!(
                    "[livequery] {} callback for subscription {} panicked: {}",
                    event.kind(),
                    self.request_id,
                    message
                );
                self.emit_error(&LiveQueryError::Callback(message));
            }
        }
    }

    /// Deliver an error to this subscription's error callbacks.
    pub(crate) fn emit_error(&self, error: &LiveQueryError) {
        let callbacks = self.callbacks.lock().error.clone();
        for callback in callbacks {
            self.guarded(|| callback(error));
        }
    }

    /// Run a lifecycle/error callback, containing any panic.
    fn guarded(&self, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            log::error!(
                "[livequery] callback for subscription {} panicked: {}",
                self.request_id,
                describe_panic(payload.as_ref())
            );
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("request_id", &self.request_id)
            .field("class_name", &self.class_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of one registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Wire request id.
    pub request_id: u64,
    /// Watched collection.
    pub class_name: String,
    /// Lifecycle state at snapshot time.
    pub state: SubscriptionState,
}

#[cfg(test)]
struct DetachedTransport;

#[cfg(test)]
impl SubscriptionTransport for DetachedTransport {
    fn request_unsubscribe(&self, _request_id: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{JsonDecoder, ObjectDecoder};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn create_event(request_id: u64) -> Event {
        let object = JsonDecoder.build("Message", json!({"objectId": "m1", "text": "hi"}));
        Event::new(EventKind::Create, object, None, request_id)
    }

    #[test]
    fn test_request_ids_are_unique_across_threads() {
        let ids = Arc::new(RequestIdSequence::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = ids.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| ids.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "request id {} issued twice", id);
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn test_subscriptions_get_distinct_ids() {
        let a = Subscription::detached("A", json!({}));
        let b = Subscription::detached("B", json!({}));
        assert_ne!(a.request_id(), b.request_id());
    }

    #[test]
    fn test_state_machine_confirm() {
        let sub = Subscription::detached("Message", json!({}));
        assert!(sub.is_pending());

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        sub.on_subscribe(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        sub.confirm();
        assert!(sub.is_subscribed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Duplicate confirmation after a resubscribe pass is a no-op.
        sub.confirm();
        assert!(sub.is_subscribed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_state_machine_fail_is_terminal() {
        let sub = Subscription::detached("Message", json!({}));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();
        sub.on_error(move |err| seen.lock().push(err.to_string()));

        sub.fail(&LiveQueryError::Subscription {
            request_id: sub.request_id(),
            code: Some(1),
            message: "invalid query".into(),
        });
        assert_eq!(sub.state(), SubscriptionState::Error);
        assert_eq!(errors.lock().len(), 1);

        // No transition out of Error.
        sub.confirm();
        assert_eq!(sub.state(), SubscriptionState::Error);
        sub.mark_unsubscribed();
        assert_eq!(sub.state(), SubscriptionState::Error);
    }

    #[test]
    fn test_unsubscribe_from_pending_and_subscribed() {
        let pending = Subscription::detached("Message", json!({}));
        pending.mark_unsubscribed();
        assert_eq!(pending.state(), SubscriptionState::Unsubscribed);

        let subscribed = Subscription::detached("Message", json!({}));
        subscribed.confirm();
        subscribed.mark_unsubscribed();
        assert_eq!(subscribed.state(), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn test_events_fan_out_to_matching_kind_only() {
        let sub = Subscription::detached("Message", json!({}));
        let creates = Arc::new(AtomicUsize::new(0));
        let updates = Arc::new(AtomicUsize::new(0));
        let created = creates.clone();
        let updated = updates.clone();
        sub.on_create(move |_| {
            created.fetch_add(1, Ordering::SeqCst);
        })
        .on_update(move |_| {
            updated.fetch_add(1, Ordering::SeqCst);
        });

        sub.handle_event(&create_event(sub.request_id()));
        assert_eq!(creates.load(Ordering::SeqCst), 1);
        assert_eq!(updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_break_delivery() {
        let sub = Subscription::detached("Message", json!({}));
        let delivered = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        sub.on_create(|_| panic!("broken callback"));
        let count = delivered.clone();
        sub.on_create(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        let error_count = errors.clone();
        sub.on_error(move |err| {
            assert!(matches!(err, LiveQueryError::Callback(_)));
            error_count.fetch_add(1, Ordering::SeqCst);
        });

        sub.handle_event(&create_event(sub.request_id()));
        assert_eq!(delivered.load(Ordering::SeqCst), 1, "second callback still runs");
        assert_eq!(errors.load(Ordering::SeqCst), 1, "panic surfaced as error event");
    }

    #[test]
    fn test_wire_payload_builders() {
        let sub = Subscription::new(
            Weak::<DetachedTransport>::new(),
            &RequestIdSequence::shared(),
            "GameScore",
            json!({"score": {"$gt": 10}}),
            Some(vec!["score".into()]),
            Some("tok".into()),
        );

        let value = serde_json::to_value(sub.subscribe_message()).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["requestId"], sub.request_id());
        assert_eq!(value["query"]["className"], "GameScore");
        assert_eq!(value["query"]["where"], json!({"score": {"$gt": 10}}));
        assert_eq!(value["sessionToken"], "tok");

        let value = serde_json::to_value(sub.unsubscribe_message()).unwrap();
        assert_eq!(value["op"], "unsubscribe");
        assert_eq!(value["requestId"], sub.request_id());
    }
}
