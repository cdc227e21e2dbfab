//! Notification Preference Resolver.
//!
//! Answers "is this recipient reachable right now, for this notification
//! type, on this channel?". Every read goes through `resolve_effective`,
//! which fills in the documented defaults (every channel and type enabled,
//! no quiet hours, DND off) so callers never deal with missing fields.
//!
//! Quiet-hour windows are `HH:MM` ranges evaluated in the recipient's local
//! time (`utc_offset_minutes`). A window whose end is before its start
//! crosses midnight. Days use 0 = Sunday .. 6 = Saturday; an empty day
//! list means every day.

use crate::{
    clock::Clock,
    error::{DeskError, DeskResult},
    repository::PreferenceRepository,
    types::RecipientId,
};
use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};

// ── Vocabulary ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Push,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::InApp, Channel::Email, Channel::Push, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InApp => "in_app",
            Self::Email => "email",
            Self::Push => "push",
            Self::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    EscalationAssigned,
    EscalationUrgent,
    ManualAssignmentRequired,
    EscalationTimeout,
    ResponseRecorded,
    EscalationResolved,
    SlaWarning,
    SlaBreach,
    WorkloadAlert,
    System,
}

impl NotificationType {
    pub const ALL: [NotificationType; 10] = [
        NotificationType::EscalationAssigned,
        NotificationType::EscalationUrgent,
        NotificationType::ManualAssignmentRequired,
        NotificationType::EscalationTimeout,
        NotificationType::ResponseRecorded,
        NotificationType::EscalationResolved,
        NotificationType::SlaWarning,
        NotificationType::SlaBreach,
        NotificationType::WorkloadAlert,
        NotificationType::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EscalationAssigned => "escalation_assigned",
            Self::EscalationUrgent => "escalation_urgent",
            Self::ManualAssignmentRequired => "manual_assignment_required",
            Self::EscalationTimeout => "escalation_timeout",
            Self::ResponseRecorded => "response_recorded",
            Self::EscalationResolved => "escalation_resolved",
            Self::SlaWarning => "sla_warning",
            Self::SlaBreach => "sla_breach",
            Self::WorkloadAlert => "workload_alert",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

// ── Preference records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuietHours {
    /// `HH:MM`, local to the recipient.
    pub start_time: String,
    /// `HH:MM`. Earlier than `start_time` means the window crosses midnight.
    pub end_time: String,
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    /// Types that are delivered even inside the window.
    #[serde(default)]
    pub exceptions: Vec<NotificationType>,
}

impl QuietHours {
    pub fn new(start_time: &str, end_time: &str) -> Self {
        Self {
            start_time: start_time.to_string(),
            end_time: end_time.to_string(),
            days_of_week: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    /// Whether `local` falls inside this window for a notification of `kind`.
    /// Malformed times never suppress anything.
    pub fn suppresses(&self, local: DateTime<FixedOffset>, kind: NotificationType) -> bool {
        if self.exceptions.contains(&kind) {
            return false;
        }
        let day = local.weekday().num_days_from_sunday() as u8;
        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&day) {
            return false;
        }
        let (Some(start), Some(end)) = (parse_hhmm(&self.start_time), parse_hhmm(&self.end_time))
        else {
            return false;
        };
        let minute = local.hour() * 60 + local.minute();
        if start == end {
            false
        } else if start < end {
            minute >= start && minute < end
        } else {
            minute >= start || minute < end
        }
    }

    fn validate(&self, label: &str, errors: &mut Vec<String>) {
        if parse_hhmm(&self.start_time).is_none() {
            errors.push(format!("{label}: invalid start time '{}' (expected HH:MM)", self.start_time));
        }
        if parse_hhmm(&self.end_time).is_none() {
            errors.push(format!("{label}: invalid end time '{}' (expected HH:MM)", self.end_time));
        }
        for day in &self.days_of_week {
            if *day > 6 {
                errors.push(format!("{label}: day of week {day} out of range 0-6"));
            }
        }
    }
}

/// Parse `HH:MM` into minutes after midnight.
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelPreference {
    pub enabled: bool,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
}

impl Default for ChannelPreference {
    fn default() -> Self {
        Self { enabled: true, quiet_hours: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DoNotDisturb {
    pub enabled: bool,
    /// No expiry means DND stays on until explicitly disabled.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl DoNotDisturb {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.until.is_none_or(|until| until > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPreferences {
    pub recipient_id: RecipientId,
    #[serde(default)]
    pub channels: BTreeMap<Channel, ChannelPreference>,
    #[serde(default)]
    pub types: BTreeMap<NotificationType, bool>,
    #[serde(default)]
    pub global_quiet_hours: Option<QuietHours>,
    #[serde(default)]
    pub do_not_disturb: DoNotDisturb,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NotificationPreferences {
    /// The documented default: everything enabled, no quiet hours, DND off.
    pub fn defaults_for(recipient_id: &str) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            channels: Channel::ALL.into_iter().map(|c| (c, ChannelPreference::default())).collect(),
            types: NotificationType::ALL.into_iter().map(|t| (t, true)).collect(),
            global_quiet_hours: None,
            do_not_disturb: DoNotDisturb::default(),
            utc_offset_minutes: 0,
            updated_at: None,
        }
    }

    /// Fill every missing channel and type with its default.
    pub fn resolve_effective(mut self) -> Self {
        for channel in Channel::ALL {
            self.channels.entry(channel).or_default();
        }
        for kind in NotificationType::ALL {
            self.types.entry(kind).or_insert(true);
        }
        self
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        self.channels.get(&channel).is_none_or(|c| c.enabled)
    }

    pub fn type_enabled(&self, kind: NotificationType) -> bool {
        self.types.get(&kind).copied().unwrap_or(true)
    }

    fn local_time(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or(Utc.fix());
        now.with_timezone(&offset)
    }

    /// Global window first (with its exceptions), then the channel's own window.
    pub fn in_quiet_hours(&self, channel: Channel, kind: NotificationType, now: DateTime<Utc>) -> bool {
        let local = self.local_time(now);
        if let Some(global) = &self.global_quiet_hours {
            if global.suppresses(local, kind) {
                return true;
            }
        }
        self.channels
            .get(&channel)
            .and_then(|c| c.quiet_hours.as_ref())
            .is_some_and(|q| q.suppresses(local, kind))
    }

    pub fn in_do_not_disturb(&self, now: DateTime<Utc>) -> bool {
        self.do_not_disturb.is_active(now)
    }
}

/// Validation errors for an externally supplied preference record. Empty when valid.
pub fn validate_preferences(prefs: &NotificationPreferences, now: DateTime<Utc>) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(global) = &prefs.global_quiet_hours {
        global.validate("global quiet hours", &mut errors);
    }
    for (channel, pref) in &prefs.channels {
        if let Some(q) = &pref.quiet_hours {
            q.validate(&format!("{channel} quiet hours"), &mut errors);
        }
    }
    if prefs.do_not_disturb.enabled {
        if let Some(until) = prefs.do_not_disturb.until {
            if until <= now {
                errors.push(format!("do-not-disturb expiry {until} is in the past"));
            }
        }
    }
    if !(-14 * 60..=14 * 60).contains(&prefs.utc_offset_minutes) {
        errors.push(format!("utc offset {} minutes out of range", prefs.utc_offset_minutes));
    }
    errors
}

// ── Resolver ─────────────────────────────────────────────────────────────────

pub struct PreferenceResolver {
    repo: Arc<dyn PreferenceRepository>,
    clock: Arc<dyn Clock>,
}

impl PreferenceResolver {
    pub fn new(repo: Arc<dyn PreferenceRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Stored preferences with defaults filled in. A missing record is not an error.
    pub fn get_preferences(&self, recipient: &str) -> DeskResult<NotificationPreferences> {
        Ok(match self.repo.load_preferences(recipient)? {
            Some(prefs) => prefs.resolve_effective(),
            None => NotificationPreferences::defaults_for(recipient),
        })
    }

    pub fn is_in_quiet_hours(
        &self,
        recipient: &str,
        channel: Channel,
        kind: NotificationType,
    ) -> DeskResult<bool> {
        let prefs = self.get_preferences(recipient)?;
        Ok(prefs.in_quiet_hours(channel, kind, self.clock.now()))
    }

    pub fn is_in_do_not_disturb(&self, recipient: &str) -> DeskResult<bool> {
        let prefs = self.get_preferences(recipient)?;
        Ok(prefs.in_do_not_disturb(self.clock.now()))
    }

    pub fn validate_preferences(&self, prefs: &NotificationPreferences) -> Vec<String> {
        validate_preferences(prefs, self.clock.now())
    }

    /// Replace the whole record after validation.
    pub fn save_preferences(&self, mut prefs: NotificationPreferences) -> DeskResult<NotificationPreferences> {
        let now = self.clock.now();
        let errors = validate_preferences(&prefs, now);
        if !errors.is_empty() {
            return Err(DeskError::Validation(errors));
        }
        prefs.updated_at = Some(now);
        let prefs = prefs.resolve_effective();
        self.repo.save_preferences(&prefs)?;
        Ok(prefs)
    }

    /// Read-modify-write of the full record. Callers serialize concurrent
    /// edits for the same recipient.
    fn update<F>(&self, recipient: &str, edit: F) -> DeskResult<NotificationPreferences>
    where
        F: FnOnce(&mut NotificationPreferences),
    {
        let mut prefs = self.get_preferences(recipient)?;
        // A lapsed DND would fail validation on every later edit.
        if prefs.do_not_disturb.until.is_some_and(|u| u <= self.clock.now()) {
            prefs.do_not_disturb = DoNotDisturb::default();
        }
        edit(&mut prefs);
        let prefs = self.save_preferences(prefs)?;
        log::debug!("preferences updated for {recipient}");
        Ok(prefs)
    }

    pub fn set_channel_enabled(
        &self,
        recipient: &str,
        channel: Channel,
        enabled: bool,
    ) -> DeskResult<NotificationPreferences> {
        self.update(recipient, |p| {
            p.channels.entry(channel).or_default().enabled = enabled;
        })
    }

    pub fn set_notification_type_enabled(
        &self,
        recipient: &str,
        kind: NotificationType,
        enabled: bool,
    ) -> DeskResult<NotificationPreferences> {
        self.update(recipient, |p| {
            p.types.insert(kind, enabled);
        })
    }

    /// `channel = None` sets the global window. `quiet_hours = None` clears it.
    pub fn set_quiet_hours(
        &self,
        recipient: &str,
        channel: Option<Channel>,
        quiet_hours: Option<QuietHours>,
    ) -> DeskResult<NotificationPreferences> {
        self.update(recipient, |p| match channel {
            Some(c) => p.channels.entry(c).or_default().quiet_hours = quiet_hours,
            None => p.global_quiet_hours = quiet_hours,
        })
    }

    pub fn set_do_not_disturb(
        &self,
        recipient: &str,
        until: Option<DateTime<Utc>>,
    ) -> DeskResult<NotificationPreferences> {
        self.update(recipient, |p| {
            p.do_not_disturb = DoNotDisturb { enabled: true, until };
        })
    }

    pub fn disable_do_not_disturb(&self, recipient: &str) -> DeskResult<NotificationPreferences> {
        self.update(recipient, |p| p.do_not_disturb = DoNotDisturb::default())
    }

    pub fn reset_to_defaults(&self, recipient: &str) -> DeskResult<NotificationPreferences> {
        self.repo.delete_preferences(recipient)?;
        log::info!("preferences reset to defaults for {recipient}");
        Ok(NotificationPreferences::defaults_for(recipient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // 2026-03-04 is a Wednesday.
        Utc.with_ymd_and_hms(2026, 3, 4, h, m, 0).unwrap()
    }

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("22:30"), Some(22 * 60 + 30));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("7:00"), None);
        assert_eq!(parse_hhmm("07:60"), None);
        assert_eq!(parse_hhmm("garbage"), None);
    }

    #[test]
    fn overnight_window_wraps() {
        let mut prefs = NotificationPreferences::defaults_for("u1");
        prefs.global_quiet_hours = Some(QuietHours::new("22:00", "06:00"));
        let kind = NotificationType::System;
        assert!(prefs.in_quiet_hours(Channel::Email, kind, at(23, 30)));
        assert!(prefs.in_quiet_hours(Channel::Email, kind, at(2, 0)));
        assert!(!prefs.in_quiet_hours(Channel::Email, kind, at(12, 0)));
        assert!(!prefs.in_quiet_hours(Channel::Email, kind, at(6, 0)));
    }

    #[test]
    fn exceptions_and_days_are_honored() {
        let mut q = QuietHours::new("09:00", "17:00");
        q.exceptions = vec![NotificationType::SlaBreach];
        q.days_of_week = vec![0, 6];
        let mut prefs = NotificationPreferences::defaults_for("u1");
        prefs.channels.get_mut(&Channel::Push).unwrap().quiet_hours = Some(q);

        // Wednesday is outside the configured weekend days.
        assert!(!prefs.in_quiet_hours(Channel::Push, NotificationType::System, at(10, 0)));

        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap();
        assert!(prefs.in_quiet_hours(Channel::Push, NotificationType::System, saturday));
        assert!(!prefs.in_quiet_hours(Channel::Push, NotificationType::SlaBreach, saturday));
        assert!(!prefs.in_quiet_hours(Channel::Email, NotificationType::System, saturday));
    }

    #[test]
    fn offset_shifts_the_window() {
        let mut prefs = NotificationPreferences::defaults_for("u1");
        prefs.global_quiet_hours = Some(QuietHours::new("22:00", "06:00"));
        prefs.utc_offset_minutes = 120;
        // 21:00 UTC is 23:00 local.
        assert!(prefs.in_quiet_hours(Channel::Sms, NotificationType::System, at(21, 0)));
    }

    #[test]
    fn dnd_expiry() {
        let now = at(12, 0);
        let forever = DoNotDisturb { enabled: true, until: None };
        let expired = DoNotDisturb { enabled: true, until: Some(at(11, 0)) };
        let later = DoNotDisturb { enabled: true, until: Some(at(13, 0)) };
        assert!(forever.is_active(now));
        assert!(!expired.is_active(now));
        assert!(later.is_active(now));
        assert!(!DoNotDisturb::default().is_active(now));
    }

    #[test]
    fn validation_collects_every_problem() {
        let now = at(12, 0);
        let mut prefs = NotificationPreferences::defaults_for("u1");
        let mut q = QuietHours::new("25:00", "6am");
        q.days_of_week = vec![7];
        prefs.global_quiet_hours = Some(q);
        prefs.do_not_disturb = DoNotDisturb { enabled: true, until: Some(at(11, 0)) };
        let errors = validate_preferences(&prefs, now);
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(validate_preferences(&NotificationPreferences::defaults_for("u1"), now).is_empty());
    }
}
