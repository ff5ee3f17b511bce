//! Dashboard event broadcaster
//!
//! Listeners subscribe per business id. Delivery is at-most-once: a full
//! listener misses the event, a closed one is pruned on the next publish.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use crate::models::DashboardEvent;
use super::AppState;

type Subscriber = mpsc::Sender<DashboardEvent>;

pub struct EventBroadcaster {
    subscribers: RwLock<HashMap<i64, Vec<Subscriber>>>,
    capacity: usize,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn subscribe(&self, business_id: i64) -> mpsc::Receiver<DashboardEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        subs.entry(business_id).or_default().push(tx);
        rx
    }

    /// Returns how many listeners accepted the event.
    pub async fn publish(&self, event: DashboardEvent) -> usize {
        let business_id = event.business_id();
        let mut subs = self.subscribers.write().await;
        let Some(listeners) = subs.get_mut(&business_id) else {
            return 0;
        };

        listeners.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in listeners.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Listener for business {} is full, dropping {}", business_id, event.kind());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        if listeners.is_empty() {
            subs.remove(&business_id);
        }
        delivered
    }

    pub async fn listener_count(&self, business_id: i64) -> usize {
        self.subscribers
            .read()
            .await
            .get(&business_id)
            .map(|l| l.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// `GET /api/events/{business_id}`
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<i64>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broadcaster.subscribe(business_id).await;
    tracing::info!(
        "Dashboard listener subscribed to business {} ({} open)",
        business_id,
        state.broadcaster.listener_count(business_id).await
    );

    let stream = ReceiverStream::new(rx).filter_map(|event| async move {
        serde_json::to_string(&event)
            .ok()
            .map(|json| Ok::<_, Infallible>(Event::default().event(event.kind()).data(json)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SmsDirection, SmsMessage, SmsStatus};
    use chrono::Utc;

    fn sms_event(business_id: i64) -> DashboardEvent {
        DashboardEvent::NewSms {
            message: SmsMessage {
                id: 1,
                business_id,
                message_sid: Some("SM1".to_string()),
                thread_id: format!("{}-5551234567", business_id),
                direction: SmsDirection::Inbound,
                from_number: "+15551234567".to_string(),
                to_number: "+15550001111".to_string(),
                body: "hi".to_string(),
                status: SmsStatus::Received,
                contact_id: None,
                is_auto_response: false,
                in_reply_to: None,
                analysis: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_events_scoped_to_business() {
        let bus = EventBroadcaster::new(8);
        let mut rx_one = bus.subscribe(1).await;
        let mut rx_two = bus.subscribe(2).await;

        assert_eq!(bus.publish(sms_event(1)).await, 1);

        let got = rx_one.recv().await.unwrap();
        assert_eq!(got.kind(), "new_sms");
        assert!(rx_two.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_listener_is_skipped() {
        let bus = EventBroadcaster::new(1);
        let _rx = bus.subscribe(1).await;

        assert_eq!(bus.publish(sms_event(1)).await, 1);
        assert_eq!(bus.publish(sms_event(1)).await, 0);
    }

    #[tokio::test]
    async fn test_closed_listener_pruned() {
        let bus = EventBroadcaster::new(4);
        let rx = bus.subscribe(1).await;
        drop(rx);

        assert_eq!(bus.publish(sms_event(1)).await, 0);
        assert_eq!(bus.listener_count(1).await, 0);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(sms_event(3)).unwrap();
        assert_eq!(json["type"], "new_sms");
        assert_eq!(json["message"]["businessId"], 3);
    }
}
