//! Subscription hub
//!
//! Every subscription owns a bounded FIFO queue with a single consumer. When the queue is full
//! the oldest notification is dropped. A notification carrying the state an entity already has
//! in the queue or has already delivered is not enqueued again.
//!
//! Events come from two sources: wallet operations publish every quote and proof state change
//! they make, and a background task polls the mint for the entities a subscription filters on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument;

use super::types::{MeltQuote, MintQuote};
use super::Wallet;
use crate::nuts::{CheckStateRequest, ProofState, PublicKey, SubscribeParams, SubscriptionKind};
use crate::Error;

/// Notification delivered to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationPayload {
    /// Proof State
    ProofState(ProofState),
    /// Mint quote update
    MintQuoteUpdate(MintQuote),
    /// Melt quote update
    MeltQuoteUpdate(MeltQuote),
}

impl NotificationPayload {
    /// Subscription kind that receives this payload
    pub fn kind(&self) -> SubscriptionKind {
        match self {
            Self::ProofState(_) => SubscriptionKind::ProofState,
            Self::MintQuoteUpdate(_) => SubscriptionKind::Bolt11MintQuote,
            Self::MeltQuoteUpdate(_) => SubscriptionKind::Bolt11MeltQuote,
        }
    }

    /// Quote id or hex encoded Y the payload is about
    pub fn entity(&self) -> String {
        match self {
            Self::ProofState(state) => state.y.to_hex(),
            Self::MintQuoteUpdate(quote) => quote.id.clone(),
            Self::MeltQuoteUpdate(quote) => quote.id.clone(),
        }
    }

    fn state(&self) -> String {
        match self {
            Self::ProofState(state) => state.state.to_string(),
            Self::MintQuoteUpdate(quote) => quote.state.to_string(),
            Self::MeltQuoteUpdate(quote) => quote.state.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<NotificationPayload>,
    last_state: HashMap<String, String>,
}

#[derive(Debug)]
struct Subscriber {
    kind: SubscriptionKind,
    filters: HashSet<String>,
    capacity: usize,
    queue: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

impl Subscriber {
    fn matches(&self, payload: &NotificationPayload) -> bool {
        payload.kind() == self.kind && self.filters.contains(&payload.entity())
    }

    fn push(&self, payload: NotificationPayload) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let entity = payload.entity();
        let state = payload.state();

        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());

            if queue.last_state.get(&entity) == Some(&state) {
                return;
            }

            if queue.items.len() >= self.capacity {
                if let Some(dropped) = queue.items.pop_front() {
                    tracing::warn!(
                        "Subscription queue full, dropping notification for {}",
                        dropped.entity()
                    );
                }
            }

            queue.last_state.insert(entity, state);
            queue.items.push_back(payload);
        }

        self.notify.notify_one();
    }

    fn pop(&self) -> Option<NotificationPayload> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Fan-out of state changes to subscriptions
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHub {
    subscribers: Arc<Mutex<HashMap<u64, Arc<Subscriber>>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionHub {
    /// Create new [`SubscriptionHub`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a notification to every subscription that filters on its entity
    pub fn publish(&self, payload: NotificationPayload) {
        let subscribers: Vec<Arc<Subscriber>> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.matches(&payload))
            .cloned()
            .collect();

        for subscriber in subscribers {
            subscriber.push(payload.clone());
        }
    }

    /// Number of open subscriptions
    pub fn active_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn register(&self, params: &SubscribeParams, capacity: usize) -> (u64, Arc<Subscriber>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let subscriber = Arc::new(Subscriber {
            kind: params.kind,
            filters: params.filters.iter().cloned().collect(),
            capacity: capacity.max(1),
            queue: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });

        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, subscriber.clone());

        (id, subscriber)
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// Open subscription
///
/// Closing, explicitly or by dropping, stops the poller and fails any later
/// [`recv`](Self::recv) with [`Error::SubscriptionClosed`].
#[derive(Debug)]
pub struct ActiveSubscription {
    id: String,
    key: u64,
    subscriber: Arc<Subscriber>,
    hub: SubscriptionHub,
    poller: Option<JoinHandle<()>>,
    recv_timeout: Duration,
}

impl ActiveSubscription {
    /// Subscription id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next notification, waiting up to the configured receive timeout
    pub async fn recv(&self) -> Result<NotificationPayload, Error> {
        self.recv_timeout(self.recv_timeout).await
    }

    /// Next notification, waiting up to `timeout`
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<NotificationPayload, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(payload) = self.subscriber.pop() {
                return Ok(payload);
            }

            if self.subscriber.closed.load(Ordering::SeqCst) {
                return Err(Error::SubscriptionClosed);
            }

            tokio::time::timeout_at(deadline, self.subscriber.notify.notified())
                .await
                .map_err(|_| Error::Timeout)?;
        }
    }

    /// Notification if one is queued
    pub fn try_recv(&self) -> Result<Option<NotificationPayload>, Error> {
        match self.subscriber.pop() {
            Some(payload) => Ok(Some(payload)),
            None if self.subscriber.closed.load(Ordering::SeqCst) => {
                Err(Error::SubscriptionClosed)
            }
            None => Ok(None),
        }
    }

    /// Close the subscription and release its resources
    pub fn close(&self) {
        if let Some(poller) = &self.poller {
            poller.abort();
        }
        self.subscriber.close();
        self.hub.remove(self.key);
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl Wallet {
    /// Subscribe to quote or proof state changes
    ///
    /// The current state of each filtered entity is delivered first, followed by every
    /// change.
    #[instrument(skip(self))]
    pub async fn subscribe(&self, params: SubscribeParams) -> Result<ActiveSubscription, Error> {
        let (key, subscriber) = self
            .subscriptions
            .register(&params, self.config.subscription_capacity);

        let sub_id = params.id.clone().unwrap_or_else(|| key.to_string());

        tracing::debug!(
            "Subscription {} opened for {:?} with {} filters",
            sub_id,
            params.kind,
            params.filters.len()
        );

        let wallet = self.clone();
        let interval = self.config.subscription_poll_interval();
        let poller = tokio::spawn(async move {
            loop {
                if let Err(err) = wallet.poll_subscription(&params).await {
                    tracing::debug!("Subscription poll failed: {}", err);
                }
                tokio::time::sleep(interval).await;
            }
        });

        Ok(ActiveSubscription {
            id: sub_id,
            key,
            subscriber,
            hub: self.subscriptions.clone(),
            poller: Some(poller),
            recv_timeout: self.config.subscription_recv_timeout(),
        })
    }

    /// Query the mint once for every entity a subscription filters on
    async fn poll_subscription(&self, params: &SubscribeParams) -> Result<(), Error> {
        match params.kind {
            SubscriptionKind::Bolt11MintQuote => {
                for quote_id in params.filters.iter() {
                    self.mint_quote_state(quote_id).await?;
                }
            }
            SubscriptionKind::Bolt11MeltQuote => {
                for quote_id in params.filters.iter() {
                    self.melt_quote_status(quote_id).await?;
                }
            }
            SubscriptionKind::ProofState => {
                let ys = params
                    .filters
                    .iter()
                    .map(|y| PublicKey::from_str(y))
                    .collect::<Result<Vec<_>, _>>()?;

                let response = self
                    .read_call("post_check_state", || {
                        self.client
                            .post_check_state(CheckStateRequest { ys: ys.clone() })
                    })
                    .await?;

                for state in response.states {
                    self.subscriptions
                        .publish(NotificationPayload::ProofState(state));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::mint_url::MintUrl;
    use crate::nuts::{CurrencyUnit, MintQuoteState};

    fn quote(id: &str, state: MintQuoteState) -> NotificationPayload {
        NotificationPayload::MintQuoteUpdate(MintQuote {
            id: id.to_string(),
            mint_url: MintUrl::from_str("https://mint.example.com").unwrap(),
            amount: None,
            unit: CurrencyUnit::Sat,
            request: "lnbc".to_string(),
            state,
            expiry: 0,
        })
    }

    fn subscription(hub: &SubscriptionHub, filters: &[&str], capacity: usize) -> ActiveSubscription {
        let params = SubscribeParams::new(
            SubscriptionKind::Bolt11MintQuote,
            filters.iter().map(|f| f.to_string()).collect(),
        );
        let (key, subscriber) = hub.register(&params, capacity);

        ActiveSubscription {
            id: key.to_string(),
            key,
            subscriber,
            hub: hub.clone(),
            poller: None,
            recv_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_fifo_without_duplicates() {
        let hub = SubscriptionHub::new();
        let sub = subscription(&hub, &["q1"], 16);

        hub.publish(quote("q1", MintQuoteState::Unpaid));
        hub.publish(quote("q1", MintQuoteState::Unpaid));
        hub.publish(quote("q2", MintQuoteState::Paid));
        hub.publish(quote("q1", MintQuoteState::Paid));

        assert_eq!(sub.recv().await.unwrap(), quote("q1", MintQuoteState::Unpaid));
        assert_eq!(sub.recv().await.unwrap(), quote("q1", MintQuoteState::Paid));

        // Already delivered
        hub.publish(quote("q1", MintQuoteState::Paid));
        assert!(matches!(sub.recv().await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_many_subscriptions_observe_one_event() {
        let hub = SubscriptionHub::new();
        let first = subscription(&hub, &["q1"], 16);
        let second = subscription(&hub, &["q1", "q2"], 16);

        hub.publish(quote("q1", MintQuoteState::Paid));

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_oldest_when_full() {
        let hub = SubscriptionHub::new();
        let sub = subscription(&hub, &["q1", "q2", "q3"], 2);

        hub.publish(quote("q1", MintQuoteState::Paid));
        hub.publish(quote("q2", MintQuoteState::Paid));
        hub.publish(quote("q3", MintQuoteState::Paid));

        assert_eq!(sub.recv().await.unwrap().entity(), "q2");
        assert_eq!(sub.recv().await.unwrap().entity(), "q3");
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receiver() {
        let hub = SubscriptionHub::new();
        let sub = Arc::new(subscription(&hub, &["q1"], 16));
        assert_eq!(hub.active_count(), 1);

        let receiver = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.recv_timeout(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.close();

        assert!(matches!(
            receiver.await.unwrap(),
            Err(Error::SubscriptionClosed)
        ));
        assert_eq!(hub.active_count(), 0);

        // Closed subscriptions get nothing more
        hub.publish(quote("q1", MintQuoteState::Paid));
        assert!(matches!(sub.try_recv(), Err(Error::SubscriptionClosed)));
    }
}
