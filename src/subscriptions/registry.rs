//! Subscription registry: the single owner of subscription state.

use crate::error::{RegistryError, SubscriptionError};
use crate::types::{
    ChangeHandler, SequenceNumber, SubscribedHandler, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{
    DeferredSubscribe, PendingSubmission, SubmissionTarget, Subscription, SubscriptionRequest,
};

/// Tracks every live subscription and the work waiting to be sent.
///
/// Not synchronized: the engine keeps it behind its lock.
pub struct SubscriptionRegistry {
    /// Live subscriptions by handle. Closed subscriptions are never stored.
    subscriptions: HashMap<SubscriptionHandle, Subscription>,
    /// Requests (queued or in flight) awaiting acknowledgement.
    by_sequence: HashMap<SequenceNumber, SubscriptionHandle>,
    /// Subscribed entries, for change-event routing.
    by_subscription_id: HashMap<SubscriptionId, SubscriptionHandle>,
    /// FIFO queue of requests not yet written to the transport.
    pending_submission: VecDeque<PendingSubmission>,
    /// `None` once the wire range is used up.
    next_sequence: Option<SequenceNumber>,
    next_handle: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::starting_at(SequenceNumber(1))
    }

    pub(crate) fn starting_at(first: SequenceNumber) -> Self {
        Self {
            subscriptions: HashMap::new(),
            by_sequence: HashMap::new(),
            by_subscription_id: HashMap::new(),
            pending_submission: VecDeque::new(),
            next_sequence: Some(first),
            next_handle: 1,
        }
    }

    fn allocate_sequence(&mut self) -> Result<SequenceNumber, RegistryError> {
        let seq = self.next_sequence.ok_or(RegistryError::SequenceExhausted)?;
        self.next_sequence = seq.next();
        Ok(seq)
    }

    // --- Staging ---

    /// Stage a new subscription. It is sent the next time the connection
    /// flushes.
    pub fn stage_subscribe(
        &mut self,
        request: SubscriptionRequest,
    ) -> Result<SubscriptionHandle, RegistryError> {
        let seq = self.allocate_sequence()?;
        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;

        debug!(%seq, uri = %request.resource_uri, ?handle, "staged subscribe");

        self.pending_submission.push_back(PendingSubmission {
            sequence_number: seq,
            handle,
            target: SubmissionTarget::Subscribe {
                resource_uri: request.resource_uri.clone(),
            },
        });
        self.by_sequence.insert(seq, handle);
        self.subscriptions
            .insert(handle, Subscription::from_request(handle, seq, request));

        Ok(handle)
    }

    /// Stage removal of a subscription.
    ///
    /// Unknown handles are a no-op. A subscribe that was never sent (or is
    /// parked after throttling) is dropped locally; one already in flight is
    /// cancelled as soon as its acknowledgement arrives.
    pub fn stage_unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<(), RegistryError> {
        let Some(sub) = self.subscriptions.get_mut(&handle) else {
            return Ok(());
        };
        if sub.state == SubscriptionState::PendingUnsubscribe || sub.cancel_on_ack {
            return Err(RegistryError::AlreadyPendingUnsubscribe);
        }

        if sub.state == SubscriptionState::PendingSubscribe {
            if sub.submitted {
                debug!(?handle, "subscribe in flight, unsubscribing on ack");
                sub.cancel_on_ack = true;
                sub.unsubscribe_requested = true;
            } else {
                debug!(?handle, "dropping unsent subscribe");
                self.remove_entry(handle);
            }
            return Ok(());
        }

        let Some(subscription_id) = sub.subscription_id else {
            warn!(?handle, "subscribed entry without a subscription id");
            return Ok(());
        };
        let seq = self.allocate_sequence()?;
        let Some(sub) = self.subscriptions.get_mut(&handle) else {
            return Ok(());
        };
        sub.state = SubscriptionState::PendingUnsubscribe;
        sub.sequence_number = Some(seq);
        sub.submitted = false;
        sub.unsubscribe_requested = true;

        debug!(%seq, %subscription_id, ?handle, "staged unsubscribe");

        if self.by_subscription_id.get(&subscription_id) == Some(&handle) {
            self.by_subscription_id.remove(&subscription_id);
        }
        self.by_sequence.insert(seq, handle);
        self.pending_submission.push_back(PendingSubmission {
            sequence_number: seq,
            handle,
            target: SubmissionTarget::Unsubscribe { subscription_id },
        });
        Ok(())
    }

    /// Take everything waiting to be sent, oldest first.
    pub fn drain_pending_submissions(&mut self) -> Vec<PendingSubmission> {
        let drained: Vec<PendingSubmission> = self.pending_submission.drain(..).collect();
        for item in &drained {
            if let Some(sub) = self.subscriptions.get_mut(&item.handle) {
                sub.submitted = true;
            }
        }
        drained
    }

    /// Put unsent items back at the head of the queue, keeping their order.
    ///
    /// Items whose subscription has since closed or moved on to another
    /// request are discarded.
    pub fn requeue_front(&mut self, items: Vec<PendingSubmission>) {
        for item in items.into_iter().rev() {
            let Some(sub) = self.subscriptions.get_mut(&item.handle) else {
                continue;
            };
            if sub.sequence_number != Some(item.sequence_number) {
                continue;
            }
            sub.submitted = false;
            self.pending_submission.push_front(item);
        }
    }

    // --- Acknowledgements ---

    fn awaiting(
        &self,
        seq: SequenceNumber,
        expected: SubscriptionState,
    ) -> Result<SubscriptionHandle, RegistryError> {
        self.by_sequence
            .get(&seq)
            .and_then(|handle| self.subscriptions.get(handle))
            .filter(|sub| sub.state == expected && sub.sequence_number == Some(seq))
            .map(|sub| sub.handle)
            .ok_or(RegistryError::UnknownSequenceNumber(seq))
    }

    /// Record a successful subscribe acknowledgement.
    pub fn complete_subscribe(
        &mut self,
        seq: SequenceNumber,
        subscription_id: SubscriptionId,
    ) -> Result<(), RegistryError> {
        let handle = self.awaiting(seq, SubscriptionState::PendingSubscribe)?;
        let cancel = self
            .subscriptions
            .get(&handle)
            .map_or(false, |sub| sub.cancel_on_ack);
        let unsubscribe_seq = if cancel {
            Some(self.allocate_sequence()?)
        } else {
            None
        };

        self.by_sequence.remove(&seq);
        let Some(sub) = self.subscriptions.get_mut(&handle) else {
            return Err(RegistryError::UnknownSequenceNumber(seq));
        };
        sub.subscription_id = Some(subscription_id);
        sub.submitted = false;

        match unsubscribe_seq {
            Some(next) => {
                debug!(%seq, %subscription_id, unsubscribe_seq = %next, "subscribe acked after cancel");
                sub.state = SubscriptionState::PendingUnsubscribe;
                sub.cancel_on_ack = false;
                sub.sequence_number = Some(next);
                self.by_sequence.insert(next, handle);
                self.pending_submission.push_back(PendingSubmission {
                    sequence_number: next,
                    handle,
                    target: SubmissionTarget::Unsubscribe { subscription_id },
                });
            }
            None => {
                debug!(%seq, %subscription_id, "subscribed");
                sub.state = SubscriptionState::Subscribed;
                sub.sequence_number = None;
                if let Some(previous) = self.by_subscription_id.insert(subscription_id, handle) {
                    if previous != handle {
                        warn!(%subscription_id, ?previous, "service reused a live subscription id");
                    }
                }
            }
        }
        Ok(())
    }

    /// Record a rejected subscribe. The closed subscription is handed back so
    /// its error handler can run exactly once.
    pub fn complete_subscribe_error(
        &mut self,
        seq: SequenceNumber,
        error: &SubscriptionError,
    ) -> Result<Subscription, RegistryError> {
        let handle = self.awaiting(seq, SubscriptionState::PendingSubscribe)?;
        debug!(%seq, %error, "subscribe failed");
        self.remove_entry(handle)
            .ok_or(RegistryError::UnknownSequenceNumber(seq))
    }

    /// Park a subscribe the service turned away as throttled.
    ///
    /// The subscription stays `PendingSubscribe` with no outstanding sequence
    /// number until [`restage_subscribe`](Self::restage_subscribe) queues it
    /// again. Returns `None`, leaving the entry untouched, when the
    /// subscription is already being cancelled.
    pub fn defer_subscribe(
        &mut self,
        seq: SequenceNumber,
    ) -> Result<Option<DeferredSubscribe>, RegistryError> {
        let handle = self.awaiting(seq, SubscriptionState::PendingSubscribe)?;
        let Some(sub) = self.subscriptions.get_mut(&handle) else {
            return Err(RegistryError::UnknownSequenceNumber(seq));
        };
        if sub.cancel_on_ack {
            return Ok(None);
        }

        let attempt = sub.throttled_attempts;
        sub.throttled_attempts = attempt.saturating_add(1);
        sub.sequence_number = None;
        sub.submitted = false;
        self.by_sequence.remove(&seq);

        debug!(%seq, ?handle, attempt, "subscribe throttled, deferring");
        Ok(Some(DeferredSubscribe { handle, attempt }))
    }

    /// Queue a parked subscribe again under a fresh sequence number.
    ///
    /// Returns `false` if the subscription has since closed or is no longer
    /// parked.
    pub fn restage_subscribe(&mut self, handle: SubscriptionHandle) -> Result<bool, RegistryError> {
        let parked = self.subscriptions.get(&handle).map_or(false, |sub| {
            sub.state == SubscriptionState::PendingSubscribe && sub.sequence_number.is_none()
        });
        if !parked {
            return Ok(false);
        }

        let seq = self.allocate_sequence()?;
        let Some(sub) = self.subscriptions.get_mut(&handle) else {
            return Ok(false);
        };
        sub.sequence_number = Some(seq);
        debug!(%seq, ?handle, "restaged subscribe");

        self.by_sequence.insert(seq, handle);
        self.pending_submission.push_back(PendingSubmission {
            sequence_number: seq,
            handle,
            target: SubmissionTarget::Subscribe {
                resource_uri: sub.resource_uri.clone(),
            },
        });
        Ok(true)
    }

    /// Record an unsubscribe acknowledgement.
    pub fn complete_unsubscribe(&mut self, seq: SequenceNumber) -> Result<Subscription, RegistryError> {
        let handle = self.awaiting(seq, SubscriptionState::PendingUnsubscribe)?;
        debug!(%seq, "unsubscribed");
        self.remove_entry(handle)
            .ok_or(RegistryError::UnknownSequenceNumber(seq))
    }

    // --- Routing ---

    /// Change handler for a subscribed id, or `None` for stale/unknown ids.
    pub fn route_change_event(&self, subscription_id: SubscriptionId) -> Option<ChangeHandler> {
        self.subscribed(subscription_id)
            .map(|sub| Arc::clone(&sub.on_change))
    }

    /// Subscribed callback for a freshly acknowledged id, if one was given.
    pub fn subscribed_handler(
        &self,
        subscription_id: SubscriptionId,
    ) -> Option<(SubscriptionHandle, SubscribedHandler)> {
        self.subscribed(subscription_id).and_then(|sub| {
            sub.on_subscribed
                .as_ref()
                .map(|handler| (sub.handle, Arc::clone(handler)))
        })
    }

    fn subscribed(&self, subscription_id: SubscriptionId) -> Option<&Subscription> {
        self.by_subscription_id
            .get(&subscription_id)
            .and_then(|handle| self.subscriptions.get(handle))
            .filter(|sub| sub.state == SubscriptionState::Subscribed)
    }

    // --- Bulk ---

    /// Close every subscription and empty every map.
    ///
    /// Returned in creation order.
    pub fn clear_all(&mut self) -> Vec<Subscription> {
        self.pending_submission.clear();
        self.by_sequence.clear();
        self.by_subscription_id.clear();

        let mut closed: Vec<Subscription> = self
            .subscriptions
            .drain()
            .map(|(_, mut sub)| {
                sub.close();
                sub
            })
            .collect();
        closed.sort_by_key(|sub| sub.handle);

        if !closed.is_empty() {
            debug!(count = closed.len(), "cleared all subscriptions");
        }
        closed
    }

    fn remove_entry(&mut self, handle: SubscriptionHandle) -> Option<Subscription> {
        let mut sub = self.subscriptions.remove(&handle)?;
        if let Some(seq) = sub.sequence_number {
            self.by_sequence.remove(&seq);
            self.pending_submission
                .retain(|item| item.sequence_number != seq);
        }
        if let Some(id) = sub.subscription_id {
            if self.by_subscription_id.get(&id) == Some(&handle) {
                self.by_subscription_id.remove(&id);
            }
        }
        sub.close();
        Some(sub)
    }

    // --- Queries ---

    pub fn get(&self, handle: SubscriptionHandle) -> Option<&Subscription> {
        self.subscriptions.get(&handle)
    }

    /// Current state, or `None` once the subscription is gone.
    pub fn state(&self, handle: SubscriptionHandle) -> Option<SubscriptionState> {
        self.subscriptions.get(&handle).map(|sub| sub.state)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn pending_submission_count(&self) -> usize {
        self.pending_submission.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageType;
    use crate::types::ChangeEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request(uri: &str) -> SubscriptionRequest {
        SubscriptionRequest::new(uri, |_| {}, |_| {})
    }

    fn counting_request(uri: &str, changes: Arc<AtomicUsize>) -> SubscriptionRequest {
        SubscriptionRequest::new(
            uri,
            move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        )
    }

    /// Stage, send and acknowledge a subscription.
    fn subscribed(registry: &mut SubscriptionRegistry, uri: &str, id: u32) -> SubscriptionHandle {
        let handle = registry.stage_subscribe(request(uri)).unwrap();
        let sent = registry.drain_pending_submissions();
        let seq = sent.last().unwrap().sequence_number;
        registry.complete_subscribe(seq, SubscriptionId(id)).unwrap();
        handle
    }

    fn check_invariants(registry: &SubscriptionRegistry) {
        for sub in registry.subscriptions.values() {
            assert_ne!(sub.state, SubscriptionState::Closed);
            let has_id = sub.subscription_id.is_some();
            let id_state = matches!(
                sub.state,
                SubscriptionState::Subscribed | SubscriptionState::PendingUnsubscribe
            );
            assert_eq!(has_id, id_state, "{sub:?}");
            if let Some(seq) = sub.sequence_number {
                assert_eq!(registry.by_sequence.get(&seq), Some(&sub.handle));
            }
        }
        for (seq, handle) in &registry.by_sequence {
            let sub = registry.subscriptions.get(handle).unwrap();
            assert_eq!(sub.sequence_number, Some(*seq));
        }
        for (id, handle) in &registry.by_subscription_id {
            let sub = registry.subscriptions.get(handle).unwrap();
            assert_eq!(sub.state, SubscriptionState::Subscribed);
            assert_eq!(sub.subscription_id, Some(*id));
        }
    }

    #[test]
    fn test_stage_subscribe_assigns_increasing_sequence() {
        let mut registry = SubscriptionRegistry::new();
        registry.stage_subscribe(request("uri/1")).unwrap();
        registry.stage_subscribe(request("uri/2")).unwrap();
        registry.stage_subscribe(request("uri/1")).unwrap();

        let drained = registry.drain_pending_submissions();
        let seqs: Vec<u32> = drained.iter().map(|p| p.sequence_number.0).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.pending_submission_count(), 0);
    }

    #[test]
    fn test_drain_preserves_fifo_and_types() {
        let mut registry = SubscriptionRegistry::new();
        let a = subscribed(&mut registry, "uri/A", 10);
        registry.stage_subscribe(request("uri/B")).unwrap();
        registry.stage_unsubscribe(a).unwrap();

        let drained = registry.drain_pending_submissions();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message_type(), MessageType::Subscribe);
        assert_eq!(
            drained[1].target,
            SubmissionTarget::Unsubscribe {
                subscription_id: SubscriptionId(10)
            }
        );
        assert!(drained[0].sequence_number < drained[1].sequence_number);
        check_invariants(&registry);
    }

    #[test]
    fn test_complete_subscribe_routes_events() {
        let mut registry = SubscriptionRegistry::new();
        let changes = Arc::new(AtomicUsize::new(0));
        let handle = registry
            .stage_subscribe(counting_request("uri/A", Arc::clone(&changes)))
            .unwrap();
        let seq = registry.drain_pending_submissions()[0].sequence_number;

        registry.complete_subscribe(seq, SubscriptionId(100)).unwrap();
        assert_eq!(registry.state(handle), Some(SubscriptionState::Subscribed));

        let handler = registry.route_change_event(SubscriptionId(100)).unwrap();
        handler(&ChangeEvent {
            subscription_id: SubscriptionId(100),
            data: serde_json::Value::Null,
        });
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert!(registry.route_change_event(SubscriptionId(101)).is_none());
        check_invariants(&registry);
    }

    #[test]
    fn test_duplicate_ack_is_unknown() {
        let mut registry = SubscriptionRegistry::new();
        registry.stage_subscribe(request("uri/A")).unwrap();
        let seq = registry.drain_pending_submissions()[0].sequence_number;

        registry.complete_subscribe(seq, SubscriptionId(1)).unwrap();
        assert_eq!(
            registry.complete_subscribe(seq, SubscriptionId(1)),
            Err(RegistryError::UnknownSequenceNumber(seq))
        );
    }

    #[test]
    fn test_unsubscribe_ack_with_subscribe_seq_is_unknown() {
        let mut registry = SubscriptionRegistry::new();
        registry.stage_subscribe(request("uri/A")).unwrap();
        let seq = registry.drain_pending_submissions()[0].sequence_number;

        assert!(matches!(
            registry.complete_unsubscribe(seq),
            Err(RegistryError::UnknownSequenceNumber(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_subscribe_error_closes_and_returns() {
        let mut registry = SubscriptionRegistry::new();
        let handle = registry.stage_subscribe(request("uri/A")).unwrap();
        let seq = registry.drain_pending_submissions()[0].sequence_number;

        let sub = registry
            .complete_subscribe_error(seq, &SubscriptionError::ConnectionLost)
            .unwrap();
        assert_eq!(sub.handle(), handle);
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert!(registry.is_empty());
        assert!(registry.complete_subscribe(seq, SubscriptionId(1)).is_err());
    }

    #[test]
    fn test_full_unsubscribe_cycle() {
        let mut registry = SubscriptionRegistry::new();
        let handle = subscribed(&mut registry, "uri/C", 7);

        registry.stage_unsubscribe(handle).unwrap();
        assert_eq!(
            registry.state(handle),
            Some(SubscriptionState::PendingUnsubscribe)
        );
        // Events stop routing as soon as removal is requested.
        assert!(registry.route_change_event(SubscriptionId(7)).is_none());
        check_invariants(&registry);

        let seq = registry.drain_pending_submissions()[0].sequence_number;
        let closed = registry.complete_unsubscribe(seq).unwrap();
        assert_eq!(closed.state(), SubscriptionState::Closed);
        assert_eq!(closed.subscription_id(), None);
        assert!(registry.is_empty());
        assert!(registry.route_change_event(SubscriptionId(7)).is_none());
    }

    #[test]
    fn test_double_unsubscribe_is_rejected() {
        let mut registry = SubscriptionRegistry::new();
        let handle = subscribed(&mut registry, "uri/A", 1);

        registry.stage_unsubscribe(handle).unwrap();
        assert_eq!(
            registry.stage_unsubscribe(handle),
            Err(RegistryError::AlreadyPendingUnsubscribe)
        );
    }

    #[test]
    fn test_unsubscribe_unknown_handle_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.stage_unsubscribe(SubscriptionHandle(42)), Ok(()));

        // Closed handles are simply unknown.
        let handle = subscribed(&mut registry, "uri/A", 1);
        registry.clear_all();
        assert_eq!(registry.stage_unsubscribe(handle), Ok(()));
        assert_eq!(registry.pending_submission_count(), 0);
    }

    #[test]
    fn test_unsubscribe_unsent_subscribe_drops_locally() {
        let mut registry = SubscriptionRegistry::new();
        let handle = registry.stage_subscribe(request("uri/A")).unwrap();
        registry.stage_subscribe(request("uri/B")).unwrap();

        registry.stage_unsubscribe(handle).unwrap();
        assert_eq!(registry.state(handle), None);

        let drained = registry.drain_pending_submissions();
        assert_eq!(drained.len(), 1);
        assert_eq!(
            drained[0].target,
            SubmissionTarget::Subscribe {
                resource_uri: "uri/B".into()
            }
        );
        // Handle is gone; a second call is a no-op.
        assert_eq!(registry.stage_unsubscribe(handle), Ok(()));
    }

    #[test]
    fn test_unsubscribe_in_flight_subscribe_cancels_on_ack() {
        let mut registry = SubscriptionRegistry::new();
        let handle = registry.stage_subscribe(request("uri/A")).unwrap();
        let seq = registry.drain_pending_submissions()[0].sequence_number;

        registry.stage_unsubscribe(handle).unwrap();
        assert_eq!(
            registry.stage_unsubscribe(handle),
            Err(RegistryError::AlreadyPendingUnsubscribe)
        );
        assert_eq!(
            registry.state(handle),
            Some(SubscriptionState::PendingSubscribe)
        );

        registry.complete_subscribe(seq, SubscriptionId(55)).unwrap();
        assert_eq!(
            registry.state(handle),
            Some(SubscriptionState::PendingUnsubscribe)
        );
        assert!(registry.route_change_event(SubscriptionId(55)).is_none());
        check_invariants(&registry);

        let drained = registry.drain_pending_submissions();
        assert_eq!(drained.len(), 1);
        assert_eq!(
            drained[0].target,
            SubmissionTarget::Unsubscribe {
                subscription_id: SubscriptionId(55)
            }
        );
        registry
            .complete_unsubscribe(drained[0].sequence_number)
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_all_closes_everything() {
        let mut registry = SubscriptionRegistry::new();
        let a = subscribed(&mut registry, "uri/A", 1);
        let b = registry.stage_subscribe(request("uri/B")).unwrap();
        registry.stage_unsubscribe(a).unwrap();
        let pending_seq = registry.drain_pending_submissions()[1].sequence_number;

        let closed = registry.clear_all();
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].handle(), a);
        assert_eq!(closed[1].handle(), b);
        assert!(closed.iter().all(|s| s.state() == SubscriptionState::Closed));
        assert!(closed[0].teardown_requested());
        assert!(!closed[1].teardown_requested());

        assert!(registry.is_empty());
        assert_eq!(registry.pending_submission_count(), 0);
        assert!(registry.route_change_event(SubscriptionId(1)).is_none());
        assert!(matches!(
            registry.complete_unsubscribe(pending_seq),
            Err(RegistryError::UnknownSequenceNumber(_))
        ));
    }

    #[test]
    fn test_new_subscription_after_clear_gets_fresh_sequence() {
        let mut registry = SubscriptionRegistry::new();
        registry.stage_subscribe(request("uri/A")).unwrap();
        let first = registry.drain_pending_submissions()[0].sequence_number;
        registry.clear_all();

        registry.stage_subscribe(request("uri/A")).unwrap();
        let second = registry.drain_pending_submissions()[0].sequence_number;
        assert!(second > first);
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.stage_subscribe(request("uri/A")).unwrap();
        registry.stage_subscribe(request("uri/B")).unwrap();
        let drained = registry.drain_pending_submissions();
        registry.stage_subscribe(request("uri/C")).unwrap();

        registry.requeue_front(drained);
        let again = registry.drain_pending_submissions();
        let uris: Vec<_> = again
            .iter()
            .map(|p| match &p.target {
                SubmissionTarget::Subscribe { resource_uri } => resource_uri.clone(),
                SubmissionTarget::Unsubscribe { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(uris, vec!["uri/A", "uri/B", "uri/C"]);
    }

    #[test]
    fn test_requeue_skips_cleared_items() {
        let mut registry = SubscriptionRegistry::new();
        registry.stage_subscribe(request("uri/A")).unwrap();
        let drained = registry.drain_pending_submissions();
        registry.clear_all();

        registry.requeue_front(drained);
        assert_eq!(registry.pending_submission_count(), 0);
    }

    #[test]
    fn test_sequence_exhaustion() {
        let mut registry = SubscriptionRegistry::starting_at(SequenceNumber(u32::MAX));
        registry.stage_subscribe(request("uri/last")).unwrap();
        assert_eq!(
            registry.stage_subscribe(request("uri/none")).unwrap_err(),
            RegistryError::SequenceExhausted
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_throttled_subscribe_is_parked_then_restaged() {
        let mut registry = SubscriptionRegistry::new();
        let handle = registry.stage_subscribe(request("uri/A")).unwrap();
        let first = registry.drain_pending_submissions()[0].sequence_number;

        let deferred = registry.defer_subscribe(first).unwrap().unwrap();
        assert_eq!(deferred, DeferredSubscribe { handle, attempt: 0 });
        assert_eq!(registry.state(handle), Some(SubscriptionState::PendingSubscribe));
        assert_eq!(registry.pending_submission_count(), 0);
        // The old correlation is gone.
        assert!(registry.complete_subscribe(first, SubscriptionId(1)).is_err());
        check_invariants(&registry);

        assert!(registry.restage_subscribe(handle).unwrap());
        assert!(!registry.restage_subscribe(handle).unwrap());
        let again = registry.drain_pending_submissions();
        assert_eq!(again.len(), 1);
        assert!(again[0].sequence_number > first);
        assert_eq!(
            again[0].target,
            SubmissionTarget::Subscribe {
                resource_uri: "uri/A".into()
            }
        );

        let second = registry.defer_subscribe(again[0].sequence_number).unwrap();
        assert_eq!(second.map(|d| d.attempt), Some(1));
        check_invariants(&registry);
    }

    #[test]
    fn test_throttled_cancellation_is_not_parked() {
        let mut registry = SubscriptionRegistry::new();
        let handle = registry.stage_subscribe(request("uri/A")).unwrap();
        let seq = registry.drain_pending_submissions()[0].sequence_number;
        registry.stage_unsubscribe(handle).unwrap();

        assert_eq!(registry.defer_subscribe(seq), Ok(None));
        // Still awaiting the ack, so the caller can close it.
        let closed = registry
            .complete_subscribe_error(seq, &SubscriptionError::ConnectionLost)
            .unwrap();
        assert_eq!(closed.handle(), handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_parked_subscribe_can_be_dropped_or_cleared() {
        let mut registry = SubscriptionRegistry::new();
        let dropped = registry.stage_subscribe(request("uri/A")).unwrap();
        let cleared = registry.stage_subscribe(request("uri/B")).unwrap();
        for item in registry.drain_pending_submissions() {
            registry.defer_subscribe(item.sequence_number).unwrap();
        }

        registry.stage_unsubscribe(dropped).unwrap();
        assert_eq!(registry.state(dropped), None);
        assert!(!registry.restage_subscribe(dropped).unwrap());

        let closed = registry.clear_all();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].handle(), cleared);
        assert!(!registry.restage_subscribe(cleared).unwrap());
        assert_eq!(registry.pending_submission_count(), 0);
    }

    #[test]
    fn test_subscribed_handler_lookup() {
        let mut registry = SubscriptionRegistry::new();
        let req = request("uri/A").with_subscribed_handler(|_| {});
        let handle = registry.stage_subscribe(req).unwrap();
        let seq = registry.drain_pending_submissions()[0].sequence_number;
        registry.complete_subscribe(seq, SubscriptionId(3)).unwrap();

        let (found, _) = registry.subscribed_handler(SubscriptionId(3)).unwrap();
        assert_eq!(found, handle);

        let plain = subscribed(&mut registry, "uri/B", 4);
        assert!(registry.state(plain).is_some());
        assert!(registry.subscribed_handler(SubscriptionId(4)).is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Operation {
            Subscribe,
            Unsubscribe(usize),
            Drain,
            AckSubscribe(usize, u32),
            RejectSubscribe(usize),
            AckUnsubscribe(usize),
            Throttle(usize),
            Restage(usize),
            ClearAll,
        }

        fn operation_strategy() -> impl Strategy<Value = Operation> {
            prop_oneof![
                3 => Just(Operation::Subscribe),
                2 => any::<usize>().prop_map(Operation::Unsubscribe),
                2 => Just(Operation::Drain),
                3 => (any::<usize>(), 0u32..16).prop_map(|(i, id)| Operation::AckSubscribe(i, id)),
                1 => any::<usize>().prop_map(Operation::RejectSubscribe),
                2 => any::<usize>().prop_map(Operation::AckUnsubscribe),
                1 => any::<usize>().prop_map(Operation::Throttle),
                1 => any::<usize>().prop_map(Operation::Restage),
                1 => Just(Operation::ClearAll),
            ]
        }

        fn pick<T: Copy>(items: &[T], index: usize) -> Option<T> {
            if items.is_empty() {
                None
            } else {
                Some(items[index % items.len()])
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(300))]

            /// Property: bookkeeping invariants hold after any operation sequence.
            #[test]
            fn prop_invariants_hold(ops in prop::collection::vec(operation_strategy(), 1..60)) {
                let mut registry = SubscriptionRegistry::new();
                let mut handles = Vec::new();
                let mut sent = Vec::new();
                let mut last_seq = 0u32;

                for op in ops {
                    match op {
                        Operation::Subscribe => {
                            handles.push(registry.stage_subscribe(request("uri")).unwrap());
                        }
                        Operation::Unsubscribe(i) => {
                            if let Some(h) = pick(&handles, i) {
                                let _ = registry.stage_unsubscribe(h);
                            }
                        }
                        Operation::Drain => {
                            for item in registry.drain_pending_submissions() {
                                prop_assert!(item.sequence_number.0 > last_seq);
                                last_seq = item.sequence_number.0;
                                sent.push(item.sequence_number);
                            }
                        }
                        Operation::AckSubscribe(i, id) => {
                            if let Some(seq) = pick(&sent, i) {
                                let _ = registry.complete_subscribe(seq, SubscriptionId(id));
                            }
                        }
                        Operation::RejectSubscribe(i) => {
                            if let Some(seq) = pick(&sent, i) {
                                let _ = registry.complete_subscribe_error(seq, &SubscriptionError::ConnectionLost);
                            }
                        }
                        Operation::AckUnsubscribe(i) => {
                            if let Some(seq) = pick(&sent, i) {
                                let _ = registry.complete_unsubscribe(seq);
                            }
                        }
                        Operation::Throttle(i) => {
                            if let Some(seq) = pick(&sent, i) {
                                let _ = registry.defer_subscribe(seq);
                            }
                        }
                        Operation::Restage(i) => {
                            if let Some(h) = pick(&handles, i) {
                                let _ = registry.restage_subscribe(h);
                            }
                        }
                        Operation::ClearAll => {
                            let closed = registry.clear_all();
                            prop_assert!(closed.iter().all(|s| s.state() == SubscriptionState::Closed));
                            for seq in &sent {
                                prop_assert!(registry.complete_subscribe(*seq, SubscriptionId(0)).is_err());
                            }
                        }
                    }
                    check_invariants(&registry);
                }
            }
        }
    }
}
