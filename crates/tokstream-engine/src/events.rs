//! Run notifications and their subscribers.
//!
//! Subscribers are kept in one list per notification kind and invoked
//! synchronously, in registration order, on whichever task drives the run.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokstream_vocab::Token;

/// A token was appended to the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEvent {
    /// Position in the run's history; BOS is 0.
    pub position: usize,
    pub token: Token,
}

/// A word was completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordEvent {
    /// Zero-based index among the run's words.
    pub index: usize,
    pub word: String,
}

/// Why a streaming run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Boundary token or step budget.
    Completed,
    /// A newer run took over the session.
    Superseded,
    /// Stopped by an explicit interrupt.
    Interrupted,
    /// The backend failed mid-run.
    Failed,
}

/// A streaming run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishEvent {
    pub reason: FinishReason,
    /// Accumulated text at the end of the run.
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ranked candidates for the next manual step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionEvent {
    pub tokens: Vec<Token>,
}

/// Handle returned by every `on_*` registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscribers<E> {
    list: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
        }
    }
}

impl<E> Subscribers<E> {
    fn add(&self, id: SubscriptionId, callback: Callback<E>) {
        self.list
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut list = self.list.write().unwrap_or_else(PoisonError::into_inner);
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        list.len() != before
    }

    fn emit(&self, event: &E) {
        // Snapshot first so callbacks may (un)subscribe.
        let callbacks: Vec<Callback<E>> = self
            .list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    fn len(&self) -> usize {
        self.list.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Per-session subscriber registry.
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    tokens: Subscribers<TokenEvent>,
    words: Subscribers<WordEvent>,
    finishes: Subscribers<FinishEvent>,
    distributions: Subscribers<DistributionEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_token<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&TokenEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.tokens.add(id, Arc::new(f));
        id
    }

    pub fn on_word<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&WordEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.words.add(id, Arc::new(f));
        id
    }

    pub fn on_finish<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&FinishEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.finishes.add(id, Arc::new(f));
        id
    }

    pub fn on_distribution<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&DistributionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.distributions.add(id, Arc::new(f));
        id
    }

    /// Remove a subscription of any kind. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.tokens.remove(id)
            | self.words.remove(id)
            | self.finishes.remove(id)
            | self.distributions.remove(id)
    }

    /// Total number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tokens.len() + self.words.len() + self.finishes.len() + self.distributions.len()
    }

    pub fn emit_token(&self, event: &TokenEvent) {
        self.tokens.emit(event);
    }

    pub fn emit_word(&self, event: &WordEvent) {
        self.words.emit(event);
    }

    pub fn emit_finish(&self, event: &FinishEvent) {
        self.finishes.emit(event);
    }

    pub fn emit_distribution(&self, event: &DistributionEvent) {
        self.distributions.emit(event);
    }

    /// Token notifications as a [`Stream`] that ends after the next finish
    /// notification.
    pub fn token_stream(self: &Arc<Self>) -> TokenStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Arc::new(Mutex::new(Some(tx)));

        let token_id = self.on_token({
            let sender = Arc::clone(&sender);
            move |event: &TokenEvent| {
                if let Some(tx) = sender.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    let _ = tx.send(event.clone());
                }
            }
        });
        let finish_id = self.on_finish(move |_: &FinishEvent| {
            sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        });

        TokenStream {
            rx,
            hub: Arc::clone(self),
            subscriptions: [token_id, finish_id],
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Stream of [`TokenEvent`]s; unsubscribes when dropped.
pub struct TokenStream {
    rx: mpsc::UnboundedReceiver<TokenEvent>,
    hub: Arc<EventHub>,
    subscriptions: [SubscriptionId; 2],
}

impl Stream for TokenStream {
    type Item = TokenEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TokenEvent>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        for id in self.subscriptions {
            self.hub.unsubscribe(id);
        }
    }
}
