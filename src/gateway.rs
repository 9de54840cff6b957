//! External collaborator seams: message delivery, audience resolution,
//! holiday lookup.
//!
//! The engine only ever talks to these traits. Real channel adapters
//! (WhatsApp, SMS, ...) live outside this crate; the implementations here
//! cover development, embedding, and tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::{Error, Result};

/// Delivery failure classification. Transient failures are retried with
/// backoff; permanent ones fail the recipient immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

/// Receipt returned by the gateway for an accepted outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

/// Outbound message delivery.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Deliver `text` to `subject_id`. Returns the channel's message id.
    async fn send(&self, subject_id: &str, text: &str)
        -> std::result::Result<DeliveryReceipt, GatewayError>;
}

/// Who an automation goes out to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudienceSpec {
    /// Explicit contact ids, resolvable in-process.
    ContactList { contact_ids: Vec<String> },
    /// A saved segment, resolvable only by the external contact directory.
    Segment { segment_id: String },
}

/// Turns an audience spec into a concrete recipient list.
#[async_trait]
pub trait AudienceResolver: Send + Sync {
    async fn resolve(&self, audience: &AudienceSpec, organization_id: &str)
        -> Result<Vec<String>>;
}

/// Answers whether a local calendar date is a holiday.
///
/// Consulted only when a schedule sets `skip_holidays`.
pub trait HolidayCalendar: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// Gateway that logs every send and fabricates receipts. Default for
/// `flowcast serve` until a channel adapter is wired in.
#[derive(Debug, Default)]
pub struct LoggingGateway;

#[async_trait]
impl MessageGateway for LoggingGateway {
    async fn send(&self, subject_id: &str, text: &str)
        -> std::result::Result<DeliveryReceipt, GatewayError>
    {
        let message_id = uuid::Uuid::new_v4().to_string();
        info!(subject_id, message_id, text, "outbound message");
        Ok(DeliveryReceipt { message_id })
    }
}

/// Resolver for audiences that need no external lookup.
#[derive(Debug, Default)]
pub struct InlineAudienceResolver;

#[async_trait]
impl AudienceResolver for InlineAudienceResolver {
    async fn resolve(&self, audience: &AudienceSpec, organization_id: &str)
        -> Result<Vec<String>>
    {
        match audience {
            AudienceSpec::ContactList { contact_ids } => Ok(contact_ids.clone()),
            AudienceSpec::Segment { segment_id } => Err(Error::Execution(format!(
                "segment '{}' for org '{}' requires an external audience resolver",
                segment_id, organization_id
            ))),
        }
    }
}

/// Calendar with no holidays.
#[derive(Debug, Default)]
pub struct NoHolidays;

impl HolidayCalendar for NoHolidays {
    fn is_holiday(&self, _date: NaiveDate) -> bool {
        false
    }
}

/// Calendar backed by an explicit date set (config-driven or test-driven).
#[derive(Debug, Default)]
pub struct FixedHolidayCalendar {
    dates: BTreeSet<NaiveDate>,
}

impl FixedHolidayCalendar {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self { dates: dates.into_iter().collect() }
    }
}

impl HolidayCalendar for FixedHolidayCalendar {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }
}

/// Shared test doubles for the collaborator traits.
#[cfg(test)]
pub mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records sends and plays back scripted failures per subject.
    #[derive(Default)]
    pub struct MockGateway {
        sent: Mutex<Vec<(String, String)>>,
        scripts: Mutex<HashMap<String, VecDeque<GatewayError>>>,
    }

    impl MockGateway {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue a failure for the next send to `subject_id`.
        pub fn fail_next(&self, subject_id: &str, err: GatewayError) {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.entry(subject_id.to_string()).or_default().push_back(err);
        }

        /// All (subject_id, text) pairs delivered so far.
        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }

        /// Texts delivered to one subject, in order.
        pub fn sent_to(&self, subject_id: &str) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == subject_id)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MessageGateway for MockGateway {
        async fn send(&self, subject_id: &str, text: &str)
            -> std::result::Result<DeliveryReceipt, GatewayError>
        {
            if let Some(queue) = self.scripts.lock().unwrap().get_mut(subject_id) {
                if let Some(err) = queue.pop_front() {
                    return Err(err);
                }
            }
            self.sent
                .lock()
                .unwrap()
                .push((subject_id.to_string(), text.to_string()));
            Ok(DeliveryReceipt { message_id: uuid::Uuid::new_v4().to_string() })
        }
    }

    /// Resolver returning a fixed list regardless of the spec.
    pub struct StaticAudience(pub Vec<String>);

    #[async_trait]
    impl AudienceResolver for StaticAudience {
        async fn resolve(&self, _audience: &AudienceSpec, _organization_id: &str)
            -> Result<Vec<String>>
        {
            Ok(self.0.clone())
        }
    }
}
