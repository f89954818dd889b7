use serde::{Deserialize, Serialize};

/// The addressing headers of a message.
///
/// Only the headers the transports reason about are modelled; everything else belongs to the
/// body as far as this crate is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<String>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action<S: Into<String>>(mut self, action: S) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_to<S: Into<String>>(mut self, to: S) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Returns true when no addressing header is present at all.
    pub fn is_empty(&self) -> bool {
        self.action.is_none()
            && self.to.is_none()
            && self.reply_to.is_none()
            && self.message_id.is_none()
            && self.relates_to.is_none()
    }

    /// Drops every addressing header, used when the addressing version forbids them on the wire.
    pub fn clear_addressing(&mut self) {
        *self = Self::default();
    }
}
