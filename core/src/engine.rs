//! The escalation desk. Wires the components together and reacts to the
//! incident-handling layer's lifecycle events.
//!
//! LIFECYCLE (per escalation):
//!   1. created   → rule match, member pick, assignment row, SLA tracker,
//!                  assignee notified (or team leads, for manual assignment)
//!   2. responded → response clock stamped, team leads notified
//!   3. resolved  → resolution clock stamped, assignment completed,
//!                  workload snapshot refreshed, team leads notified
//!
//! The periodic scan (see `scheduler`) hands overdue unassigned escalations
//! to fallback teams, flags SLA breaches and sends at-risk warnings.
//!
//! RULES:
//!   - Components never call each other through the desk; the desk only
//!     sequences them.
//!   - Every state transition the desk performs is recorded in the event log.
//!   - A failed lifecycle notification is logged and never fails the transition.
//!   - Recipient ids are member ids: team leads and assignees are addressed
//!     by the same id the identity layer uses.

use crate::{
    assignment_engine::{AssignmentEngine, AssignmentOutcome, RuleMatch, TimeoutHandoff},
    clock::Clock,
    config::DeskConfig,
    error::{DeskError, DeskResult},
    event::{DeskEvent, EventLogEntry},
    notification_dispatcher::{
        DeliveryChannel, DeliveryStatus, InAppChannel, LoggingChannel, NotificationDispatcher,
        NotificationPayload, NotificationRecord, SendResults,
    },
    notification_preferences::{Channel, NotificationPriority, NotificationType, PreferenceResolver},
    repository::{EventLog, RecipientDirectory, TeamRepository, WorkloadRepository},
    sla_tracker::{BreachFlag, SlaClock, SlaTracker, SlaTrackerService, UpcomingBreach},
    store::DeskStore,
    team::{Escalation, Severity},
    types::{MemberId, RecipientId},
    workload_balancer::{AssignmentRecord, CapacityAdvisory, WorkloadBalancer},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What one periodic scan did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanReport {
    pub handoffs: Vec<TimeoutHandoff>,
    pub failed_handoffs: Vec<HandoffFailure>,
    pub breaches: Vec<BreachFlag>,
    pub at_risk: Vec<UpcomingBreach>,
}

/// A pending escalation the scan could not move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandoffFailure {
    pub escalation_id: String,
    pub from_team: String,
    pub reason: String,
}

pub struct EscalationDesk {
    store: Arc<DeskStore>,
    clock: Arc<dyn Clock>,
    config: DeskConfig,
    pub balancer: Arc<WorkloadBalancer>,
    pub assignments: AssignmentEngine,
    pub sla: SlaTrackerService,
    pub preferences: Arc<PreferenceResolver>,
    pub notifications: NotificationDispatcher,
}

impl EscalationDesk {
    /// Desk with the in-app channel and log-backed email, push and SMS.
    pub fn new(store: Arc<DeskStore>, clock: Arc<dyn Clock>, config: DeskConfig) -> Self {
        let channels: Vec<Arc<dyn DeliveryChannel>> = vec![
            Arc::new(InAppChannel),
            Arc::new(LoggingChannel::new(Channel::Email)),
            Arc::new(LoggingChannel::new(Channel::Push)),
            Arc::new(LoggingChannel::new(Channel::Sms)),
        ];
        Self::build(store, clock, config, channels)
    }

    /// Build a fully wired desk with the given channel transports.
    pub fn build(
        store: Arc<DeskStore>,
        clock: Arc<dyn Clock>,
        config: DeskConfig,
        channels: Vec<Arc<dyn DeliveryChannel>>,
    ) -> Self {
        let balancer = Arc::new(WorkloadBalancer::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            config.workload.clone(),
        ));
        let assignments =
            AssignmentEngine::new(store.clone(), balancer.clone(), clock.clone(), config.assignment.clone());
        let sla = SlaTrackerService::new(store.clone(), clock.clone(), config.sla.clone());
        let preferences = Arc::new(PreferenceResolver::new(store.clone(), clock.clone()));
        let notifications = channels.into_iter().fold(
            NotificationDispatcher::new(
                store.clone(),
                preferences.clone(),
                store.clone(),
                clock.clone(),
                config.delivery.clone(),
            ),
            |dispatcher, channel| dispatcher.with_channel(channel),
        );

        Self {
            store,
            clock,
            config,
            balancer,
            assignments,
            sla,
            preferences,
            notifications,
        }
    }

    pub fn store(&self) -> &DeskStore {
        &self.store
    }

    pub fn config(&self) -> &DeskConfig {
        &self.config
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Route a newly raised escalation.
    ///
    /// NoEligibleMember is returned to the caller. If the matched rule has an
    /// unassigned timeout the escalation is queued first and team leads are told.
    pub async fn handle_escalation_created(&self, escalation: &Escalation) -> DeskResult<AssignmentOutcome> {
        match self.assignments.assign(escalation) {
            Ok(outcome) => {
                self.after_routing(escalation, &outcome).await?;
                Ok(outcome)
            }
            Err(e @ DeskError::NoEligibleMember { .. }) => {
                if let Some(pending) = self.assignments.pending(&escalation.escalation_id)? {
                    self.manual_required(escalation, &pending.rule, pending.escalate_at).await?;
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Complete a manual assignment for a queued escalation.
    pub async fn assign_manually(&self, escalation_id: &str, member_id: &str) -> DeskResult<AssignmentOutcome> {
        let pending = self
            .assignments
            .pending(escalation_id)?
            .ok_or_else(|| DeskError::not_found("pending escalation", escalation_id))?;
        let outcome = self.assignments.assign_manually(escalation_id, member_id)?;
        self.after_routing(&pending.escalation, &outcome).await?;
        Ok(outcome)
    }

    async fn after_routing(&self, escalation: &Escalation, outcome: &AssignmentOutcome) -> DeskResult<()> {
        match outcome {
            AssignmentOutcome::Assigned { assignment, rule } => self.assigned(escalation, assignment, rule).await,
            AssignmentOutcome::AwaitingManualAssignment { rule, escalate_at, .. } => {
                self.manual_required(escalation, rule, *escalate_at).await
            }
        }
    }

    async fn assigned(&self, escalation: &Escalation, assignment: &AssignmentRecord, rule: &RuleMatch) -> DeskResult<()> {
        let tracker = self.open_tracker(escalation, assignment, rule)?;

        self.record("assignment", DeskEvent::EscalationAssigned {
            escalation_id: escalation.escalation_id.clone(),
            team_id:       assignment.team_id.clone(),
            member_id:     assignment.member_id.clone(),
            rule_id:       rule.rule_id.clone(),
            severity:      escalation.severity,
        })?;
        self.record("sla", DeskEvent::SlaTrackerCreated {
            escalation_id:       tracker.escalation_id.clone(),
            response_deadline:   tracker.response_deadline,
            resolution_deadline: tracker.resolution_deadline,
        })?;

        let (kind, priority) = match escalation.severity {
            Severity::Critical => (NotificationType::EscalationUrgent, NotificationPriority::Critical),
            Severity::High => (NotificationType::EscalationAssigned, NotificationPriority::High),
            _ => (NotificationType::EscalationAssigned, NotificationPriority::Normal),
        };
        let payload = NotificationPayload::new(
            &assignment.member_id,
            kind,
            priority,
            format!("Escalation assigned: {}", display_title(escalation)),
            format!(
                "You have been assigned a {} escalation. Respond by {}.",
                escalation.severity.as_str(),
                tracker.response_deadline.format("%Y-%m-%d %H:%M UTC")
            ),
        )
        .for_escalation(&escalation.escalation_id);
        self.notify_quietly(&payload).await;

        self.check_capacity(&assignment.team_id).await
    }

    /// Tracker for a fresh assignment. Idempotent, so the hand-off path can
    /// open it before its own bookkeeping.
    fn open_tracker(&self, escalation: &Escalation, assignment: &AssignmentRecord, rule: &RuleMatch) -> DeskResult<SlaTracker> {
        let sla_config = self
            .sla
            .configuration_for(&assignment.team_id)?
            .with_targets(rule.response_time_minutes, rule.resolution_time_minutes);
        self.sla.create_tracker(&escalation.escalation_id, assignment, &sla_config)
    }

    async fn manual_required(
        &self,
        escalation: &Escalation,
        rule: &RuleMatch,
        escalate_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> DeskResult<()> {
        self.record("assignment", DeskEvent::ManualAssignmentRequired {
            escalation_id: escalation.escalation_id.clone(),
            team_id:       rule.team_id.clone(),
            escalate_at,
        })?;
        let payload = NotificationPayload::new(
            "",
            NotificationType::ManualAssignmentRequired,
            NotificationPriority::High,
            format!("Manual assignment needed: {}", display_title(escalation)),
            format!("Escalation {} is waiting for a team member.", escalation.escalation_id),
        )
        .for_escalation(&escalation.escalation_id);
        self.notify_leads(&rule.team_id, &payload).await;
        Ok(())
    }

    async fn check_capacity(&self, team_id: &str) -> DeskResult<()> {
        let team = self.store.team(team_id)?;
        let projection = self.balancer.predict_capacity(team_id, &team.member_ids, 0)?;
        if projection.advisory != CapacityAdvisory::ApproachingCapacity {
            return Ok(());
        }
        self.record("assignment", DeskEvent::CapacityWarning {
            team_id:         team_id.to_string(),
            projected_total: projection.projected_total,
            threshold:       projection.threshold,
        })?;
        let payload = NotificationPayload::new(
            "",
            NotificationType::WorkloadAlert,
            NotificationPriority::High,
            format!("{} is near capacity", team.name),
            projection.message,
        );
        self.notify_leads(team_id, &payload).await;
        Ok(())
    }

    /// First response from the assignee. Repeat calls return the first stamp
    /// and record nothing.
    pub async fn handle_response(&self, escalation_id: &str) -> DeskResult<SlaTracker> {
        let before = self.sla.tracker(escalation_id)?;
        let tracker = self.sla.record_response(escalation_id)?;
        if before.is_some_and(|t| t.first_response_at.is_some()) {
            return Ok(tracker);
        }
        let Some(responded_at) = tracker.first_response_at else {
            return Ok(tracker);
        };
        self.record("sla", DeskEvent::ResponseRecorded {
            escalation_id: escalation_id.to_string(),
            responded_at,
            breached:      tracker.response_breached,
        })?;
        let payload = NotificationPayload::new(
            "",
            NotificationType::ResponseRecorded,
            NotificationPriority::Low,
            format!("Response recorded for {escalation_id}"),
            format!("{} responded to escalation {escalation_id}.", tracker.member_id),
        )
        .for_escalation(escalation_id);
        self.notify_leads(&tracker.team_id, &payload).await;
        Ok(tracker)
    }

    /// Resolution from the incident layer: closes both clocks and the assignment.
    pub async fn handle_resolution(&self, escalation_id: &str) -> DeskResult<SlaTracker> {
        let before = self.sla.tracker(escalation_id)?;
        let tracker = self.sla.record_resolution(escalation_id)?;

        // Runs on every call: a retry closes rows an interrupted call left open.
        let team_id = self
            .store
            .open_assignment(escalation_id)?
            .map_or_else(|| tracker.team_id.clone(), |open| open.team_id);
        for closed in self.balancer.complete_assignment(escalation_id, &team_id)? {
            self.record("assignment", DeskEvent::AssignmentCompleted {
                escalation_id: escalation_id.to_string(),
                team_id:       closed.team_id,
                member_id:     closed.member_id,
            })?;
        }
        if before.is_some_and(|t| t.resolved_at.is_some()) {
            return Ok(tracker);
        }

        if let Some(resolved_at) = tracker.resolved_at {
            self.record("sla", DeskEvent::ResolutionRecorded {
                escalation_id: escalation_id.to_string(),
                resolved_at,
                breached:      tracker.resolution_breached,
            })?;
        }

        let payload = NotificationPayload::new(
            "",
            NotificationType::EscalationResolved,
            NotificationPriority::Normal,
            format!("Escalation {escalation_id} resolved"),
            if tracker.resolution_breached {
                "Resolved after the SLA deadline.".to_string()
            } else {
                "Resolved within SLA.".to_string()
            },
        )
        .for_escalation(escalation_id);
        self.notify_leads(&tracker.team_id, &payload).await;
        Ok(tracker)
    }

    // ── Periodic work ──────────────────────────────────────────────────────

    /// Timeouts, breach flags and at-risk warnings. Safe to run repeatedly:
    /// every flag is raised at most once. One escalation that cannot be
    /// handed off or notified never stops the others.
    pub async fn scan(&self) -> DeskResult<ScanReport> {
        let mut report = ScanReport::default();

        match self.assignments.due_pending() {
            Ok(due) => {
                for pending in due {
                    let escalation_id = pending.escalation.escalation_id.clone();
                    let from_team = pending.rule.team_id.clone();
                    let result = match self.assignments.hand_off(pending) {
                        Ok(handoff) => {
                            let routed = self.handoff(&handoff).await;
                            report.handoffs.push(handoff);
                            routed
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        report.failed_handoffs.push(self.handoff_failed(escalation_id, from_team, &e));
                    }
                }
            }
            Err(e) => log::warn!("scan: pending escalations unavailable: {e}"),
        }

        report.breaches = self.sla.detect_breaches()?;
        for breach in &report.breaches {
            if let Err(e) = self.breached(breach).await {
                log::warn!("breach of {} not recorded: {e}", breach.tracker.escalation_id);
            }
        }

        report.at_risk = self.sla.take_at_risk()?;
        for warning in &report.at_risk {
            if let Err(e) = self.warn_at_risk(warning).await {
                log::warn!("at-risk warning for {} not recorded: {e}", warning.tracker.escalation_id);
            }
        }

        if report != ScanReport::default() {
            log::info!(
                "scan: {} handoff(s), {} failed, {} breach(es), {} at risk",
                report.handoffs.len(),
                report.failed_handoffs.len(),
                report.breaches.len(),
                report.at_risk.len()
            );
        }
        Ok(report)
    }

    fn handoff_failed(&self, escalation_id: String, from_team: String, error: &DeskError) -> HandoffFailure {
        log::warn!("escalation {escalation_id} could not be handed off from {from_team}: {error}");
        let failure = HandoffFailure { escalation_id, from_team, reason: error.to_string() };
        let event = DeskEvent::HandoffFailed {
            escalation_id: failure.escalation_id.clone(),
            from_team:     failure.from_team.clone(),
            reason:        failure.reason.clone(),
        };
        if let Err(e) = self.record("assignment", event) {
            log::warn!("could not log failed handoff of {}: {e}", failure.escalation_id);
        }
        failure
    }

    async fn handoff(&self, handoff: &TimeoutHandoff) -> DeskResult<()> {
        if let Some(AssignmentOutcome::Assigned { assignment, rule }) = &handoff.outcome {
            self.open_tracker(&handoff.escalation, assignment, rule)?;
        }
        self.record("assignment", DeskEvent::EscalationTimedOut {
            escalation_id: handoff.escalation_id.clone(),
            from_team:     handoff.from_team.clone(),
            to_team:       handoff.to_team.clone(),
            hops:          handoff.hops,
        })?;

        match &handoff.outcome {
            Some(outcome) => self.after_routing(&handoff.escalation, outcome).await,
            None => {
                let team = handoff.to_team.as_deref().unwrap_or(&handoff.from_team);
                let payload = NotificationPayload::new(
                    "",
                    NotificationType::EscalationTimeout,
                    NotificationPriority::High,
                    format!("Escalation {} still unassigned", handoff.escalation_id),
                    match &handoff.to_team {
                        Some(to) => format!("Handed from {} to {to}; manual assignment needed.", handoff.from_team),
                        None => format!("No fallback team left after {} hop(s).", handoff.hops),
                    },
                )
                .for_escalation(&handoff.escalation_id);
                self.notify_leads(team, &payload).await;
                Ok(())
            }
        }
    }

    async fn breached(&self, breach: &BreachFlag) -> DeskResult<()> {
        let tracker = &breach.tracker;
        self.record("sla", DeskEvent::SlaBreached {
            escalation_id: tracker.escalation_id.clone(),
            team_id:       tracker.team_id.clone(),
            clock:         breach.clock,
            overdue_ms:    breach.overdue_ms,
        })?;
        let (priority, what) = match breach.clock {
            SlaClock::Response => (NotificationPriority::High, "response"),
            SlaClock::Resolution => (NotificationPriority::Critical, "resolution"),
        };
        let payload = NotificationPayload::new(
            &tracker.member_id,
            NotificationType::SlaBreach,
            priority,
            format!("SLA breached: {}", tracker.escalation_id),
            format!("The {what} deadline passed {} minute(s) ago.", breach.overdue_ms / 60_000),
        )
        .for_escalation(&tracker.escalation_id);
        self.notify_quietly(&payload).await;
        self.notify_leads(&tracker.team_id, &payload).await;
        Ok(())
    }

    async fn warn_at_risk(&self, warning: &UpcomingBreach) -> DeskResult<()> {
        let tracker = &warning.tracker;
        self.record("sla", DeskEvent::SlaAtRisk {
            escalation_id:     tracker.escalation_id.clone(),
            team_id:           tracker.team_id.clone(),
            clock:             warning.clock,
            time_remaining_ms: warning.time_remaining_ms,
        })?;
        let payload = NotificationPayload::new(
            &tracker.member_id,
            NotificationType::SlaWarning,
            NotificationPriority::High,
            format!("SLA at risk: {}", tracker.escalation_id),
            format!("{} minute(s) left before the deadline.", warning.time_remaining_ms / 60_000),
        )
        .for_escalation(&tracker.escalation_id);
        self.notify_quietly(&payload).await;
        Ok(())
    }

    /// Purge archived and deleted notifications past retention.
    pub fn cleanup(&self) -> DeskResult<usize> {
        let removed = self.notifications.cleanup_old_notifications(None)?;
        if removed > 0 {
            self.record("notification", DeskEvent::NotificationsCleanedUp { removed })?;
        }
        Ok(removed)
    }

    // ── Notifications ──────────────────────────────────────────────────────

    /// Send through the dispatcher and log the outcome.
    pub async fn notify(&self, payload: &NotificationPayload) -> DeskResult<NotificationRecord> {
        let record = self.notifications.send(payload).await?;
        self.record_notification(&record)?;
        Ok(record)
    }

    pub async fn notify_many(&self, recipients: &[RecipientId], payload: &NotificationPayload) -> SendResults {
        let results = self.notifications.send_to_many(recipients, payload).await;
        for record in results.values().flatten() {
            if let Err(e) = self.record_notification(record) {
                log::warn!("could not log notification {}: {e}", record.notification_id);
            }
        }
        results
    }

    pub async fn notify_role(&self, role: &str, payload: &NotificationPayload) -> DeskResult<SendResults> {
        let recipients = self.store.recipients_with_role(role)?;
        Ok(self.notify_many(&recipients, payload).await)
    }

    async fn notify_quietly(&self, payload: &NotificationPayload) {
        if let Err(e) = self.notify(payload).await {
            log::warn!("notification to {} not sent: {e}", payload.recipient_id);
        }
    }

    async fn notify_leads(&self, team_id: &str, payload: &NotificationPayload) {
        let leads: Vec<MemberId> = match self.store.team(team_id) {
            Ok(team) => team.lead_ids,
            Err(e) => {
                log::warn!("cannot resolve leads of {team_id}: {e}");
                return;
            }
        };
        self.notify_many(&leads, payload).await;
    }

    fn record_notification(&self, record: &NotificationRecord) -> DeskResult<()> {
        let event = match record.skip_reason {
            Some(reason) => DeskEvent::NotificationSkipped {
                notification_id: record.notification_id.clone(),
                recipient_id:    record.recipient_id.clone(),
                kind:            record.kind,
                reason:          reason.as_str().to_string(),
            },
            None => DeskEvent::NotificationDispatched {
                notification_id: record.notification_id.clone(),
                recipient_id:    record.recipient_id.clone(),
                kind:            record.kind,
                sent:            record.sent_channels(),
                failed:          record
                    .deliveries
                    .iter()
                    .filter(|(_, o)| o.status == DeliveryStatus::Failed)
                    .map(|(c, _)| *c)
                    .collect(),
            },
        };
        self.record("notification", event)
    }

    // ── Event log ──────────────────────────────────────────────────────────

    fn record(&self, source: &str, event: DeskEvent) -> DeskResult<()> {
        let entry = EventLogEntry::new(source, self.clock.now(), &event)?;
        self.store.append_event(&entry)
    }

    /// Event history for an escalation, team or recipient, oldest first.
    pub fn events_for(&self, subject_id: &str) -> DeskResult<Vec<EventLogEntry>> {
        self.store.events_for_subject(subject_id)
    }
}

fn display_title(escalation: &Escalation) -> &str {
    if escalation.title.is_empty() {
        &escalation.escalation_id
    } else {
        &escalation.title
    }
}
