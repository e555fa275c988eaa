//! Tracks the subscription set issued on the current connection and reports
//! when every query has delivered its initial rows.

use tracing::{debug, info, trace, warn};

use crate::connection::ConnectionHandle;
use crate::event::{Generation, SubscriptionEvent};
use crate::protocol::{ClientMessage, PIXEL_QUERY, RequestId};
use crate::transport::TransportError;

pub fn default_queries() -> Vec<String> {
    vec![PIXEL_QUERY.to_string()]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    Applied,
    Failed(String),
}

#[derive(Clone, Debug)]
struct TrackedQuery {
    request_id: RequestId,
    query: String,
    state: QueryState,
}

/// Result of feeding a subscription event to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionUpdate {
    /// Every query of the current set has been applied. Emitted once per `subscribe`.
    Ready,
    Rejected { query: String, error: String },
}

#[derive(Debug, Default)]
pub struct SubscriptionCoordinator {
    generation: Generation,
    queries: Vec<TrackedQuery>,
    applied: usize,
    ready: bool,
}

impl SubscriptionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues one subscription per query on `connection` and restarts readiness
    /// tracking for `generation`. Returns `Ok(true)` when the set is empty and
    /// therefore ready immediately.
    ///
    /// A failed send leaves that query pending; the first such error is returned
    /// after every query has been attempted.
    pub fn subscribe(
        &mut self,
        connection: &ConnectionHandle,
        generation: Generation,
        queries: &[String],
    ) -> Result<bool, TransportError> {
        self.generation = generation;
        self.applied = 0;
        self.ready = false;
        self.queries.clear();

        let mut first_error = None;
        for query in queries {
            let request_id = connection.next_request_id();
            self.queries.push(TrackedQuery {
                request_id,
                query: query.clone(),
                state: QueryState::Pending,
            });
            let message = ClientMessage::Subscribe {
                request_id,
                query: query.clone(),
            };
            if let Err(err) = connection.send(message) {
                warn!(target = "pixel_canvas::subscription", query = %query, error = %err, "failed to send subscription");
                first_error.get_or_insert(err);
            }
        }
        debug!(target = "pixel_canvas::subscription", generation, count = queries.len(), "subscriptions issued");

        if let Some(err) = first_error {
            return Err(err);
        }
        if self.queries.is_empty() {
            self.ready = true;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn on_event(&mut self, event: SubscriptionEvent) -> Option<SubscriptionUpdate> {
        match event {
            SubscriptionEvent::Applied {
                generation,
                request_id,
            } => {
                let tracked = self.current(generation, request_id)?;
                if tracked.state != QueryState::Pending {
                    trace!(target = "pixel_canvas::subscription", %request_id, "duplicate applied signal");
                    return None;
                }
                tracked.state = QueryState::Applied;
                self.applied += 1;
                if self.ready || self.applied < self.queries.len() {
                    return None;
                }
                self.ready = true;
                info!(target = "pixel_canvas::subscription", generation, queries = self.queries.len(), "subscriptions ready");
                Some(SubscriptionUpdate::Ready)
            }
            SubscriptionEvent::Failed {
                generation,
                request_id,
                error,
            } => {
                let tracked = self.current(generation, request_id)?;
                if tracked.state == QueryState::Applied {
                    return None;
                }
                tracked.state = QueryState::Failed(error.clone());
                let query = tracked.query.clone();
                warn!(target = "pixel_canvas::subscription", query = %query, error = %error, "subscription rejected");
                Some(SubscriptionUpdate::Rejected { query, error })
            }
        }
    }

    fn current(&mut self, generation: Generation, request_id: RequestId) -> Option<&mut TrackedQuery> {
        if generation != self.generation {
            trace!(target = "pixel_canvas::subscription", generation, current = self.generation, "stale subscription signal");
            return None;
        }
        let found = self
            .queries
            .iter_mut()
            .find(|tracked| tracked.request_id == request_id);
        if found.is_none() {
            trace!(target = "pixel_canvas::subscription", %request_id, "unknown subscription request");
        }
        found
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn states(&self) -> impl Iterator<Item = (&str, &QueryState)> + '_ {
        self.queries
            .iter()
            .map(|tracked| (tracked.query.as_str(), &tracked.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use crate::transport::Outbound;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl Outbound for Recorder {
        fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn close(&self) {}

        fn is_open(&self) -> bool {
            true
        }
    }

    fn connected(generation: Generation) -> (ConnectionHandle, Arc<Recorder>) {
        let handle = ConnectionHandle::new();
        let recorder = Arc::new(Recorder::default());
        handle.attach(generation, Identity::ANONYMOUS, recorder.clone());
        (handle, recorder)
    }

    fn request_ids(recorder: &Recorder) -> Vec<RequestId> {
        recorder
            .sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                ClientMessage::Subscribe { request_id, .. } => Some(*request_id),
                _ => None,
            })
            .collect()
    }

    fn applied(generation: Generation, request_id: RequestId) -> SubscriptionEvent {
        SubscriptionEvent::Applied {
            generation,
            request_id,
        }
    }

    #[test]
    fn ready_only_after_every_query_applied() {
        let (handle, recorder) = connected(1);
        let queries: Vec<String> = ["SELECT * FROM pixel", "SELECT * FROM a", "SELECT * FROM b"]
            .into_iter()
            .map(String::from)
            .collect();
        let mut coordinator = SubscriptionCoordinator::new();
        assert!(!coordinator.subscribe(&handle, 1, &queries).unwrap());
        let ids = request_ids(&recorder);
        assert_eq!(ids.len(), 3);

        assert_eq!(coordinator.on_event(applied(1, ids[0])), None);
        assert_eq!(coordinator.on_event(applied(1, ids[1])), None);
        assert!(!coordinator.is_ready());
        assert_eq!(coordinator.applied(), 2);
        assert_eq!(
            coordinator.on_event(applied(1, ids[2])),
            Some(SubscriptionUpdate::Ready)
        );
        assert!(coordinator.is_ready());
        assert_eq!(coordinator.on_event(applied(1, ids[2])), None);
    }

    #[test]
    fn resubscribe_resets_and_ignores_previous_generation() {
        let (handle, recorder) = connected(1);
        let mut coordinator = SubscriptionCoordinator::new();
        coordinator.subscribe(&handle, 1, &default_queries()).unwrap();
        let first = request_ids(&recorder)[0];
        assert_eq!(
            coordinator.on_event(applied(1, first)),
            Some(SubscriptionUpdate::Ready)
        );

        coordinator.subscribe(&handle, 2, &default_queries()).unwrap();
        assert!(!coordinator.is_ready());
        assert_eq!(coordinator.applied(), 0);
        assert_eq!(coordinator.on_event(applied(1, first)), None);
        let second = request_ids(&recorder)[1];
        assert_eq!(
            coordinator.on_event(applied(2, second)),
            Some(SubscriptionUpdate::Ready)
        );
    }

    #[test]
    fn rejected_query_keeps_readiness_false() {
        let (handle, recorder) = connected(3);
        let mut coordinator = SubscriptionCoordinator::new();
        coordinator
            .subscribe(&handle, 3, &["SELECT * FROM nowhere".to_string()])
            .unwrap();
        let id = request_ids(&recorder)[0];
        let update = coordinator.on_event(SubscriptionEvent::Failed {
            generation: 3,
            request_id: id,
            error: "no such table".into(),
        });
        assert_eq!(
            update,
            Some(SubscriptionUpdate::Rejected {
                query: "SELECT * FROM nowhere".into(),
                error: "no such table".into()
            })
        );
        assert!(!coordinator.is_ready());
        let states: Vec<_> = coordinator.states().map(|(_, state)| state.clone()).collect();
        assert_eq!(states, vec![QueryState::Failed("no such table".into())]);
    }

    #[test]
    fn empty_query_set_is_ready_immediately() {
        let (handle, _recorder) = connected(1);
        let mut coordinator = SubscriptionCoordinator::new();
        assert!(coordinator.subscribe(&handle, 1, &[]).unwrap());
        assert!(coordinator.is_ready());
    }

    #[test]
    fn send_failure_is_reported_and_query_stays_pending() {
        let handle = ConnectionHandle::new();
        let mut coordinator = SubscriptionCoordinator::new();
        let err = coordinator
            .subscribe(&handle, 1, &default_queries())
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert_eq!(coordinator.len(), 1);
        assert!(!coordinator.is_ready());
    }
}
