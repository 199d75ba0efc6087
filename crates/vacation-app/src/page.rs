//! The tracker page's side of the worker channel.

use serde_json::Value as JsonValue;
use tracing::{debug, info};
use url::Url;
use vacation_sw::{ClientId, Message, MessageKind, PageEndpoint};

/// A message the page acted on.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// Periodic broadcast from the worker.
    Update(JsonValue),
    /// Acknowledgment of one of this page's messages.
    Ack(JsonValue),
}

/// An open tracker page.
#[derive(Debug)]
pub struct ApplicationPage {
    endpoint: PageEndpoint,
}

impl ApplicationPage {
    pub fn new(endpoint: PageEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn id(&self) -> ClientId {
        self.endpoint.id
    }

    pub fn url(&self) -> &Url {
        &self.endpoint.url
    }

    /// Whether a worker controls this page.
    pub async fn is_controlled(&self) -> bool {
        self.endpoint.controller().await.is_some()
    }

    /// Send an `action` message. Nothing is sent while the page is
    /// uncontrolled.
    pub async fn send_action(&self, data: impl Into<JsonValue>) -> bool {
        if !self.is_controlled().await {
            debug!(client = %self.id(), "Page uncontrolled, action dropped");
            return false;
        }
        self.endpoint.post_message(Message::action(data)).await
    }

    /// Wait for the next message the page understands. Unknown types are
    /// skipped. `None` once the page is closed.
    pub async fn next_message(&mut self) -> Option<PageEvent> {
        loop {
            let message = self.endpoint.recv().await?;
            if let Some(event) = self.dispatch(message) {
                return Some(event);
            }
        }
    }

    /// Like [`next_message`] without waiting.
    ///
    /// [`next_message`]: ApplicationPage::next_message
    pub fn try_next_message(&mut self) -> Option<PageEvent> {
        while let Some(message) = self.endpoint.try_recv() {
            if let Some(event) = self.dispatch(message) {
                return Some(event);
            }
        }
        None
    }

    fn dispatch(&self, message: Message) -> Option<PageEvent> {
        debug!(client = %self.id(), kind = %message.kind, "Received a message from service worker");
        match message.kind() {
            MessageKind::Update => {
                info!(client = %self.id(), data = %message.data, "Update received");
                Some(PageEvent::Update(message.data))
            }
            MessageKind::Response => {
                info!(client = %self.id(), data = %message.data, "Worker acknowledged");
                Some(PageEvent::Ack(message.data))
            }
            MessageKind::Action | MessageKind::Unknown => {
                debug!(client = %self.id(), kind = %message.kind, "Ignoring message");
                None
            }
        }
    }

    /// Close the page.
    pub async fn close(self) {
        self.endpoint.close().await;
    }
}
