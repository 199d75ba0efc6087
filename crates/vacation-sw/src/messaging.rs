//! Worker ↔ page messaging.
//!
//! ```text
//! PageEndpoint ── post_message ──► Controller.inbox ──► worker
//!      ▲                                                  │
//!      └──────────── mailbox ◄── Clients::post_to ────────┘
//!                              ◄── Clients::broadcast ────┘
//! ```
//!
//! Both directions are fire-and-forget: nothing is queued for closed pages,
//! nothing is retried and replies carry no correlation id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};
use url::Url;

use crate::worker::ServiceWorkerId;

/// Worker → page periodic broadcast.
pub const UPDATE: &str = "update";
/// Page → worker message.
pub const ACTION: &str = "action";
/// Worker → page acknowledgment.
pub const RESPONSE: &str = "response";

/// Text of the acknowledgment sent for every received message.
pub const ACK_TEXT: &str = "Message received by service worker";

// ==================== Message ====================

/// Wire shape `{type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub data: JsonValue,
}

/// Known message types. Anything else is [`MessageKind::Unknown`] and
/// must be ignored by receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Update,
    Action,
    Response,
    Unknown,
}

impl Message {
    /// Create a message.
    pub fn new(kind: impl Into<String>, data: impl Into<JsonValue>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }

    /// Create an update broadcast.
    pub fn update(data: impl Into<JsonValue>) -> Self {
        Self::new(UPDATE, data)
    }

    /// Create a page action.
    pub fn action(data: impl Into<JsonValue>) -> Self {
        Self::new(ACTION, data)
    }

    /// Create the worker's acknowledgment.
    pub fn ack() -> Self {
        Self::new(RESPONSE, ACK_TEXT)
    }

    /// Classify the message type.
    pub fn kind(&self) -> MessageKind {
        match self.kind.as_str() {
            UPDATE => MessageKind::Update,
            ACTION => MessageKind::Action,
            RESPONSE => MessageKind::Response,
            _ => MessageKind::Unknown,
        }
    }

    /// Encode to JSON text.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from JSON text.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// A message on its way to the worker, tagged with the sending page.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: ClientId,
    pub message: Message,
}

// ==================== Clients ====================

/// Unique identifier for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// The worker generation controlling a page.
#[derive(Debug, Clone)]
pub struct Controller {
    pub worker_id: ServiceWorkerId,
    pub version: String,
    inbox: mpsc::UnboundedSender<Envelope>,
}

impl Controller {
    pub(crate) fn new(
        worker_id: ServiceWorkerId,
        version: impl Into<String>,
        inbox: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            worker_id,
            version: version.into(),
            inbox,
        }
    }
}

#[derive(Debug)]
struct Client {
    url: Url,
    mailbox: mpsc::UnboundedSender<Message>,
    controller: Option<Controller>,
}

/// The set of open pages.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl Clients {
    /// Create an empty client set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a page, optionally already controlled.
    pub async fn connect(
        self: &Arc<Self>,
        url: Url,
        controller: Option<Controller>,
    ) -> PageEndpoint {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        debug!(client = %id, %url, controlled = controller.is_some(), "Client connected");

        self.clients.write().await.insert(
            id,
            Client {
                url: url.clone(),
                mailbox,
                controller,
            },
        );

        PageEndpoint {
            id,
            url,
            clients: Arc::clone(self),
            rx,
        }
    }

    /// Remove a page.
    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    /// Number of open pages.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no pages are open.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Controller of a page.
    pub async fn controller_of(&self, id: ClientId) -> Option<Controller> {
        self.clients
            .read()
            .await
            .get(&id)
            .and_then(|c| c.controller.clone())
    }

    /// URLs of pages controlled by `worker_id`.
    pub async fn match_all(&self, worker_id: ServiceWorkerId) -> Vec<Url> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| is_controlled_by(c, worker_id))
            .map(|c| c.url.clone())
            .collect()
    }

    /// Make `controller` the controller of every open page.
    pub async fn claim(&self, controller: Controller) -> usize {
        let mut clients = self.clients.write().await;
        for client in clients.values_mut() {
            client.controller = Some(controller.clone());
        }
        clients.len()
    }

    /// Drop `worker_id` as controller wherever it controls a page.
    pub async fn release(&self, worker_id: ServiceWorkerId) {
        for client in self.clients.write().await.values_mut() {
            if is_controlled_by(client, worker_id) {
                client.controller = None;
            }
        }
    }

    /// Send to one page. Returns whether the page was open.
    pub async fn post_to(&self, id: ClientId, message: Message) -> bool {
        let delivered = match self.clients.read().await.get(&id) {
            Some(client) => client.mailbox.send(message).is_ok(),
            None => false,
        };
        if !delivered {
            trace!(client = %id, "Page not open, message dropped");
            self.disconnect(id).await;
        }
        delivered
    }

    /// Send `message` to every page controlled by `worker_id`. Closed pages
    /// are pruned. Returns the number of pages reached.
    pub async fn broadcast(&self, worker_id: ServiceWorkerId, message: &Message) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let clients = self.clients.read().await;
            for (id, client) in clients.iter() {
                if !is_controlled_by(client, worker_id) {
                    continue;
                }
                if client.mailbox.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            let mut clients = self.clients.write().await;
            for id in &closed {
                clients.remove(id);
            }
        }

        trace!(kind = %message.kind, delivered, pruned = closed.len(), "Broadcast");
        delivered
    }
}

fn is_controlled_by(client: &Client, worker_id: ServiceWorkerId) -> bool {
    client
        .controller
        .as_ref()
        .is_some_and(|c| c.worker_id == worker_id)
}

// ==================== Page endpoint ====================

/// A page's side of the channel.
#[derive(Debug)]
pub struct PageEndpoint {
    /// Page ID.
    pub id: ClientId,

    /// Page URL.
    pub url: Url,

    clients: Arc<Clients>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl PageEndpoint {
    /// The worker controlling this page, if any.
    pub async fn controller(&self) -> Option<Controller> {
        self.clients.controller_of(self.id).await
    }

    /// Post a message to the controller. Returns `false` when the page is
    /// uncontrolled or the controller is gone.
    pub async fn post_message(&self, message: Message) -> bool {
        let Some(controller) = self.controller().await else {
            debug!(client = %self.id, "No controller, message not sent");
            return false;
        };
        controller
            .inbox
            .send(Envelope {
                source: self.id,
                message,
            })
            .is_ok()
    }

    /// Wait for the next message. `None` once the page is disconnected.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a message if one is waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Close the page.
    pub async fn close(self) {
        self.clients.disconnect(self.id).await;
    }
}

// ==================== Worker side ====================

/// Handle one received message: log it and acknowledge to the sender only.
pub(crate) async fn respond(clients: &Clients, envelope: Envelope) -> bool {
    info!(
        client = %envelope.source,
        kind = %envelope.message.kind,
        data = %envelope.message.data,
        "Service worker received a message"
    );
    clients.post_to(envelope.source, Message::ack()).await
}

/// Drain the worker inbox until every sender is gone.
pub(crate) fn spawn_inbox(
    clients: Arc<Clients>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = inbox.recv().await {
            respond(&clients, envelope).await;
        }
        trace!("Worker inbox closed");
    })
}

/// Periodic broadcast task. Stops on [`Heartbeat::stop`] or drop.
#[derive(Debug)]
pub struct Heartbeat {
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub(crate) fn spawn(
        clients: Arc<Clients>,
        worker_id: ServiceWorkerId,
        period: Duration,
        message: Message,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                clients.broadcast(worker_id, &message).await;
            }
        });
        Self { task }
    }

    /// Stop broadcasting.
    pub fn stop(self) {
        self.task.abort();
    }

    /// Whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page_url() -> Url {
        Url::parse("https://example.com/index.html").unwrap()
    }

    fn controller(worker_id: ServiceWorkerId) -> (Controller, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Controller::new(worker_id, "v1", tx), rx)
    }

    #[test]
    fn test_message_wire_shape() {
        let message = Message::update("new data available");
        assert_eq!(
            message.to_json().unwrap(),
            r#"{"type":"update","data":"new data available"}"#
        );

        let parsed = Message::from_json(r#"{"type":"action","data":{"button":"send"}}"#).unwrap();
        assert_eq!(parsed.kind(), MessageKind::Action);
        assert_eq!(parsed.data, json!({"button": "send"}));
    }

    #[test]
    fn test_unknown_type_is_accepted() {
        let parsed = Message::from_json(r#"{"type":"sync-v9"}"#).unwrap();
        assert_eq!(parsed.kind(), MessageKind::Unknown);
        assert_eq!(parsed.data, JsonValue::Null);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_pages_is_noop() {
        let clients = Arc::new(Clients::new());
        assert_eq!(
            clients
                .broadcast(ServiceWorkerId::new(), &Message::update("x"))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_controlled_pages_only() {
        let clients = Arc::new(Clients::new());
        let worker_id = ServiceWorkerId::new();
        let (ctl, _inbox) = controller(worker_id);

        let mut controlled = clients.connect(page_url(), Some(ctl)).await;
        let mut uncontrolled = clients.connect(page_url(), None).await;

        assert_eq!(clients.broadcast(worker_id, &Message::update("tick")).await, 1);
        assert_eq!(controlled.try_recv(), Some(Message::update("tick")));
        assert_eq!(uncontrolled.try_recv(), None);
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_pages() {
        let clients = Arc::new(Clients::new());
        let worker_id = ServiceWorkerId::new();
        let (ctl, _inbox) = controller(worker_id);

        let page = clients.connect(page_url(), Some(ctl.clone())).await;
        let _open = clients.connect(page_url(), Some(ctl)).await;
        drop(page);

        assert_eq!(clients.broadcast(worker_id, &Message::update("tick")).await, 1);
        assert_eq!(clients.len().await, 1);
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let clients = Arc::new(Clients::new());
        let worker_id = ServiceWorkerId::new();
        let page = clients.connect(page_url(), None).await;
        assert!(page.controller().await.is_none());

        let (ctl, _inbox) = controller(worker_id);
        assert_eq!(clients.claim(ctl).await, 1);
        assert_eq!(page.controller().await.unwrap().worker_id, worker_id);
        assert_eq!(clients.match_all(worker_id).await, vec![page_url()]);

        clients.release(worker_id).await;
        assert!(page.controller().await.is_none());
    }

    #[tokio::test]
    async fn test_uncontrolled_page_cannot_post() {
        let clients = Arc::new(Clients::new());
        let page = clients.connect(page_url(), None).await;
        assert!(!page.post_message(Message::action("Button clicked")).await);
    }

    #[tokio::test]
    async fn test_respond_acks_sender_only() {
        let clients = Arc::new(Clients::new());
        let worker_id = ServiceWorkerId::new();
        let (ctl, mut inbox) = controller(worker_id);

        let mut sender = clients.connect(page_url(), Some(ctl.clone())).await;
        let mut other = clients.connect(page_url(), Some(ctl)).await;

        assert!(sender.post_message(Message::action("Button clicked")).await);
        let envelope = inbox.recv().await.unwrap();
        assert_eq!(envelope.source, sender.id);

        assert!(respond(&clients, envelope).await);
        assert_eq!(sender.try_recv(), Some(Message::ack()));
        assert_eq!(other.try_recv(), None);
    }

    #[tokio::test]
    async fn test_close_disconnects() {
        let clients = Arc::new(Clients::new());
        let page = clients.connect(page_url(), None).await;
        let id = page.id;
        page.close().await;

        assert!(clients.is_empty().await);
        assert!(!clients.post_to(id, Message::ack()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_waits_one_period() {
        let clients = Arc::new(Clients::new());
        let worker_id = ServiceWorkerId::new();
        let (ctl, _inbox) = controller(worker_id);
        let mut page = clients.connect(page_url(), Some(ctl)).await;

        let heartbeat = Heartbeat::spawn(
            Arc::clone(&clients),
            worker_id,
            Duration::from_secs(10),
            Message::update("new data available"),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(page.try_recv(), None);

        assert_eq!(page.recv().await, Some(Message::update("new data available")));
        assert_eq!(page.recv().await, Some(Message::update("new data available")));
        assert!(!heartbeat.is_finished());

        heartbeat.stop();
    }
}
