//! Notification Dispatcher: policy gate plus concurrent channel fan-out.
//!
//! RULE: preferences are resolved once when `send` starts. A DND or
//! quiet-hours change that lands mid-flight does not affect that send.
//!
//! RULE: every `send` produces a record. Policy skips carry a machine-readable
//! reason; delivered records carry one outcome per attempted channel.
//!
//! RULE: channel failures and timeouts are captured as `failed` outcomes and
//! never abort sibling channels or the send itself.

use crate::{
    clock::Clock,
    config::DeliveryConfig,
    error::{DeskError, DeskResult},
    notification_preferences::{Channel, NotificationPriority, NotificationType, PreferenceResolver},
    repository::{NotificationRepository, RecipientDirectory},
    types::{new_id, EscalationId, RecipientId},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayload {
    pub recipient_id: RecipientId,
    pub kind: NotificationType,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub escalation_id: Option<EscalationId>,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NotificationPayload {
    pub fn new(
        recipient_id: &str,
        kind: NotificationType,
        priority: NotificationPriority,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            kind,
            priority,
            title: title.into(),
            message: message.into(),
            escalation_id: None,
            action_url: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn for_escalation(mut self, escalation_id: &str) -> Self {
        self.escalation_id = Some(escalation_id.to_string());
        self
    }

    fn addressed_to(&self, recipient_id: &str) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
    Pending,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub attempted_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UserInDnd,
    TypeDisabled,
    NoChannelsEnabled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInDnd => "user_in_dnd",
            Self::TypeDisabled => "type_disabled",
            Self::NoChannelsEnabled => "no_channels_enabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_in_dnd" => Some(Self::UserInDnd),
            "type_disabled" => Some(Self::TypeDisabled),
            "no_channels_enabled" => Some(Self::NoChannelsEnabled),
            _ => None,
        }
    }
}

/// Row from the `notification` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub notification_id: String,
    pub recipient_id: RecipientId,
    pub kind: NotificationType,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    pub escalation_id: Option<EscalationId>,
    pub action_url: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub skip_reason: Option<SkipReason>,
    pub deliveries: BTreeMap<Channel, DeliveryOutcome>,
    pub read_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub action_taken: Option<String>,
    pub action_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    pub fn skipped(&self) -> bool {
        self.skip_reason.is_some()
    }

    pub fn sent_channels(&self) -> Vec<Channel> {
        self.deliveries
            .iter()
            .filter(|(_, o)| o.status == DeliveryStatus::Sent)
            .map(|(c, _)| *c)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryQuery {
    pub unread_only: bool,
    pub include_archived: bool,
    pub kind: Option<NotificationType>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotificationCounts {
    pub total: u32,
    pub unread: u32,
    pub archived: u32,
    pub unread_by_type: BTreeMap<NotificationType, u32>,
}

// ── Channels ─────────────────────────────────────────────────────────────────

/// Transport for one channel. Implementations own their retry policy; the
/// dispatcher only bounds each attempt with the configured timeout.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn channel(&self) -> Channel;
    async fn deliver(&self, notification: &NotificationRecord) -> DeskResult<()>;
}

/// The stored record is the in-app inbox, so delivery is immediate.
pub struct InAppChannel;

#[async_trait]
impl DeliveryChannel for InAppChannel {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn deliver(&self, notification: &NotificationRecord) -> DeskResult<()> {
        log::debug!(
            "in-app notification {} stored for {}",
            notification.notification_id,
            notification.recipient_id
        );
        Ok(())
    }
}

/// Writes the notification to the log instead of an external provider.
pub struct LoggingChannel {
    channel: Channel,
}

impl LoggingChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl DeliveryChannel for LoggingChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(&self, notification: &NotificationRecord) -> DeskResult<()> {
        log::info!(
            "[{}] to {}: {} ({})",
            self.channel,
            notification.recipient_id,
            notification.title,
            notification.priority.as_str()
        );
        Ok(())
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

pub type SendResults = BTreeMap<RecipientId, DeskResult<NotificationRecord>>;

pub struct NotificationDispatcher {
    repo: Arc<dyn NotificationRepository>,
    preferences: Arc<PreferenceResolver>,
    directory: Arc<dyn RecipientDirectory>,
    channels: HashMap<Channel, Arc<dyn DeliveryChannel>>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
}

impl NotificationDispatcher {
    pub fn new(
        repo: Arc<dyn NotificationRepository>,
        preferences: Arc<PreferenceResolver>,
        directory: Arc<dyn RecipientDirectory>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            repo,
            preferences,
            directory,
            channels: HashMap::new(),
            clock,
            config,
        }
    }

    /// Register a transport. A later registration for the same channel wins.
    pub fn with_channel(mut self, transport: Arc<dyn DeliveryChannel>) -> Self {
        self.channels.insert(transport.channel(), transport);
        self
    }

    pub async fn send(&self, payload: &NotificationPayload) -> DeskResult<NotificationRecord> {
        let prefs = self.preferences.get_preferences(&payload.recipient_id)?;
        let now = self.clock.now();
        let critical = payload.priority == NotificationPriority::Critical;

        let mut record = NotificationRecord {
            notification_id: new_id("ntf"),
            recipient_id: payload.recipient_id.clone(),
            kind: payload.kind,
            priority: payload.priority,
            title: payload.title.clone(),
            message: payload.message.clone(),
            escalation_id: payload.escalation_id.clone(),
            action_url: payload.action_url.clone(),
            data: payload.data.clone(),
            created_at: now,
            skip_reason: None,
            deliveries: BTreeMap::new(),
            read_at: None,
            archived_at: None,
            deleted_at: None,
            action_taken: None,
            action_at: None,
        };

        let eligible: Vec<Channel> = Channel::ALL
            .into_iter()
            .filter(|c| prefs.channel_enabled(*c) && (critical || !prefs.in_quiet_hours(*c, payload.kind, now)))
            .collect();

        record.skip_reason = if prefs.in_do_not_disturb(now) && !critical {
            Some(SkipReason::UserInDnd)
        } else if !prefs.type_enabled(payload.kind) {
            Some(SkipReason::TypeDisabled)
        } else if eligible.is_empty() {
            Some(SkipReason::NoChannelsEnabled)
        } else {
            None
        };

        if let Some(reason) = record.skip_reason {
            self.repo.insert_notification(&record)?;
            log::info!(
                "notification {} to {} skipped: {}",
                record.notification_id,
                record.recipient_id,
                reason.as_str()
            );
            return Ok(record);
        }

        record.deliveries = eligible
            .iter()
            .map(|c| {
                let pending = DeliveryOutcome {
                    status: DeliveryStatus::Pending,
                    attempted_at: now,
                    error: None,
                };
                (*c, pending)
            })
            .collect();
        self.repo.insert_notification(&record)?;

        let attempts = eligible.iter().map(|c| self.attempt(*c, &record));
        let outcomes: BTreeMap<Channel, DeliveryOutcome> = join_all(attempts).await.into_iter().collect();

        self.repo.attach_deliveries(&record.notification_id, &outcomes)?;
        record.deliveries = outcomes;
        log::info!(
            "notification {} to {} delivered via {:?}",
            record.notification_id,
            record.recipient_id,
            record.sent_channels()
        );
        Ok(record)
    }

    async fn attempt(&self, channel: Channel, record: &NotificationRecord) -> (Channel, DeliveryOutcome) {
        let result = match self.channels.get(&channel) {
            None => Err(DeskError::Delivery {
                channel,
                reason: "no transport registered".to_string(),
            }),
            Some(transport) => {
                let limit = std::time::Duration::from_millis(self.config.channel_timeout_ms);
                match tokio::time::timeout(limit, transport.deliver(record)).await {
                    Ok(result) => result,
                    Err(_) => Err(DeskError::Delivery {
                        channel,
                        reason: format!("timed out after {}ms", self.config.channel_timeout_ms),
                    }),
                }
            }
        };
        let attempted_at = self.clock.now();
        let outcome = match result {
            Ok(()) => DeliveryOutcome {
                status: DeliveryStatus::Sent,
                attempted_at,
                error: None,
            },
            Err(e) => {
                log::warn!("{channel} delivery of {} failed: {e}", record.notification_id);
                DeliveryOutcome {
                    status: DeliveryStatus::Failed,
                    attempted_at,
                    error: Some(e.to_string()),
                }
            }
        };
        (channel, outcome)
    }

    /// Send one copy per recipient. A failure for one recipient is reported
    /// in its slot and never stops the others.
    pub async fn send_to_many(&self, recipients: &[RecipientId], payload: &NotificationPayload) -> SendResults {
        let sends = recipients.iter().map(|r| async move {
            let result = self.send(&payload.addressed_to(r)).await;
            if let Err(e) = &result {
                log::warn!("notification to {r} failed: {e}");
            }
            (r.clone(), result)
        });
        join_all(sends).await.into_iter().collect()
    }

    pub async fn send_by_role(&self, role: &str, payload: &NotificationPayload) -> DeskResult<SendResults> {
        let recipients = self.directory.recipients_with_role(role)?;
        if recipients.is_empty() {
            log::debug!("no recipients hold role {role}");
        }
        Ok(self.send_to_many(&recipients, payload).await)
    }

    // ── Inbox ────────────────────────────────────────────────────────────────

    pub fn history(&self, recipient_id: &str, query: &HistoryQuery) -> DeskResult<Vec<NotificationRecord>> {
        self.repo.notifications_for(recipient_id, query)
    }

    fn require(&self, recipient_id: &str, notification_id: &str) -> DeskResult<()> {
        match self.repo.notification(recipient_id, notification_id)? {
            Some(_) => Ok(()),
            None => Err(DeskError::not_found("notification", notification_id)),
        }
    }

    /// True if this call changed the record.
    pub fn mark_read(&self, recipient_id: &str, notification_id: &str) -> DeskResult<bool> {
        self.require(recipient_id, notification_id)?;
        Ok(self.repo.mark_read(recipient_id, notification_id, self.clock.now())? > 0)
    }

    pub fn mark_all_read(&self, recipient_id: &str) -> DeskResult<usize> {
        self.repo.mark_all_read(recipient_id, self.clock.now())
    }

    pub fn archive(&self, recipient_id: &str, notification_id: &str) -> DeskResult<bool> {
        self.require(recipient_id, notification_id)?;
        Ok(self.repo.archive(recipient_id, notification_id, self.clock.now())? > 0)
    }

    /// Soft delete: the row stays until cleanup removes it.
    pub fn delete(&self, recipient_id: &str, notification_id: &str) -> DeskResult<bool> {
        self.require(recipient_id, notification_id)?;
        Ok(self.repo.soft_delete(recipient_id, notification_id, self.clock.now())? > 0)
    }

    pub fn counts(&self, recipient_id: &str) -> DeskResult<NotificationCounts> {
        self.repo.notification_counts(recipient_id)
    }

    /// Record the first action taken on a notification. Also marks it read.
    pub fn record_action(&self, recipient_id: &str, notification_id: &str, action: &str) -> DeskResult<bool> {
        self.require(recipient_id, notification_id)?;
        let now = self.clock.now();
        let changed = self.repo.record_action(recipient_id, notification_id, action, now)?;
        self.repo.mark_read(recipient_id, notification_id, now)?;
        Ok(changed > 0)
    }

    /// Delete archived or soft-deleted records older than the cutoff, one
    /// recipient and one bounded batch at a time.
    pub fn cleanup_old_notifications(&self, days_to_keep: Option<i64>) -> DeskResult<usize> {
        let days = days_to_keep.unwrap_or(self.config.days_to_keep);
        let cutoff = self.clock.now() - Duration::days(days);
        let batch = self.config.cleanup_batch_size.max(1);

        let mut removed = 0;
        for recipient in self.repo.recipients_with_expired(cutoff)? {
            loop {
                let n = self.repo.delete_expired_batch(&recipient, cutoff, batch)?;
                removed += n;
                if n < batch {
                    break;
                }
            }
        }
        if removed > 0 {
            log::info!("cleaned up {removed} notifications older than {days} days");
        }
        Ok(removed)
    }
}
