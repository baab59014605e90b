use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

/// Why a single delivery failed. Decides whether the address is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Transport or network trouble; the rest of the batch is retried later.
    Transient(String),
    /// The address itself is unusable; recorded and never retried.
    Permanent(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Transient(msg) => write!(f, "transient delivery failure: {msg}"),
            DeliveryError::Permanent(msg) => write!(f, "permanent delivery failure: {msg}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Outbound message channel (e-mail or equivalent).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, recipient: &str, message: &Message) -> Result<(), DeliveryError>;
}

/// Cheap syntactic check: one `@`, non-empty local part, dotted domain, no whitespace.
pub fn is_deliverable_address(addr: &str) -> bool {
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !addr.chars().any(char::is_whitespace)
}

/// Writes each delivery to the log instead of a mail server. Malformed addresses
/// still fail permanently, so the audit trail behaves as it would in production.
#[derive(Debug)]
pub struct LogTransport {
    from: String,
    delivered: AtomicU64,
}

impl LogTransport {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, recipient: &str, message: &Message) -> Result<(), DeliveryError> {
        if !is_deliverable_address(recipient) {
            return Err(DeliveryError::Permanent(format!("malformed address {recipient:?}")));
        }
        tracing::info!(
            from = %self.from,
            to = %recipient,
            subject = %message.subject,
            "mail delivered"
        );
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
