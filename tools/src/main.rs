//! desk-runner: headless runner for the escalation desk.
//!
//! Usage:
//!   desk-runner --db desk.db --setup setup.json          (seed, scan once, print summary)
//!   desk-runner --db desk.db --config desk.json --watch  (periodic scan until Ctrl-C)
//!   desk-runner --db desk.db --ipc-mode                  (JSON lines on stdin/stdout)

use anyhow::Result;
use chrono::{DateTime, Utc};
use escalation_core::{
    clock::SystemClock,
    config::DeskConfig,
    notification_dispatcher::{HistoryQuery, NotificationPayload, SendResults},
    notification_preferences::{Channel, NotificationPreferences, NotificationType, QuietHours},
    repository::TeamRepository,
    scheduler::DeskScheduler,
    setup::DeskSetup,
    team::Escalation,
    DeskResult, DeskStore, EscalationDesk,
};
use serde_json::{json, Value};
use std::{env, io::Write, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    // ── Escalation lifecycle ───────────────────────
    CreateEscalation { escalation: Escalation },
    AssignManually { escalation_id: String, member_id: String },
    RecordResponse { escalation_id: String },
    RecordResolution { escalation_id: String },

    // ── SLA queries ────────────────────────────────
    Compliance { escalation_id: String },
    BreachedSlas { team_id: String },
    UpcomingBreaches { team_id: String, window_minutes: Option<i64> },
    TeamMetrics { team_id: String, #[serde(default = "default_days_back")] days_back: i64 },

    // ── Workload queries ───────────────────────────
    Workload { team_id: String },
    Balance { team_id: String },
    PredictCapacity { team_id: String, #[serde(default)] additional: u32 },

    // ── Preferences ────────────────────────────────
    GetPreferences { recipient_id: String },
    SavePreferences { preferences: NotificationPreferences },
    SetChannel { recipient_id: String, channel: Channel, enabled: bool },
    SetType { recipient_id: String, kind: NotificationType, enabled: bool },
    SetQuietHours { recipient_id: String, channel: Option<Channel>, quiet_hours: Option<QuietHours> },
    SetDnd { recipient_id: String, until: Option<DateTime<Utc>> },
    DisableDnd { recipient_id: String },
    ResetPreferences { recipient_id: String },

    // ── Notifications ──────────────────────────────
    Send { payload: NotificationPayload },
    SendToMany { recipients: Vec<String>, payload: NotificationPayload },
    SendByRole { role: String, payload: NotificationPayload },
    History { recipient_id: String, #[serde(default)] query: HistoryQuery },
    MarkRead { recipient_id: String, notification_id: String },
    MarkAllRead { recipient_id: String },
    Archive { recipient_id: String, notification_id: String },
    Delete { recipient_id: String, notification_id: String },
    Counts { recipient_id: String },
    RecordAction { recipient_id: String, notification_id: String, action: String },

    // ── Desk ───────────────────────────────────────
    Scan,
    Cleanup { days_to_keep: Option<i64> },
    Events { subject_id: String },
    Quit,
}

fn default_days_back() -> i64 {
    30
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let watch = args.iter().any(|a| a == "--watch");
    let db = string_arg(&args, "--db").unwrap_or(":memory:");

    let config = match string_arg(&args, "--config") {
        Some(path) => DeskConfig::load(path)?,
        None => DeskConfig::default(),
    };

    if !ipc_mode {
        println!("Escalation desk — desk-runner");
        println!("  db:     {db}");
        println!("  scan:   every {}s", config.scheduler.scan_interval_secs);
        println!();
    }

    let store = Arc::new(DeskStore::open(db)?);
    store.migrate()?;
    if let Some(path) = string_arg(&args, "--setup") {
        DeskSetup::load(path)?.apply(&store)?;
    }

    let scheduler_config = config.scheduler.clone();
    let desk = Arc::new(EscalationDesk::new(store, Arc::new(SystemClock), config));

    if ipc_mode {
        run_ipc_loop(&desk).await?;
    } else if watch {
        let (handle, stop) = DeskScheduler::new(desk.clone(), scheduler_config).spawn();
        tokio::signal::ctrl_c().await?;
        let _ = stop.send(true);
        handle.await?;
        print_summary(&desk)?;
    } else {
        let report = desk.scan().await?;
        let removed = desk.cleanup()?;
        println!(
            "scan: {} handoff(s) ({} failed), {} breach(es), {} at risk; {removed} notification(s) purged",
            report.handoffs.len(),
            report.failed_handoffs.len(),
            report.breaches.len(),
            report.at_risk.len()
        );
        print_summary(&desk)?;
    }

    Ok(())
}

async fn run_ipc_loop(desk: &EscalationDesk) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let cmd: IpcCommand = match serde_json::from_str(&line) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", json!({ "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(cmd, IpcCommand::Quit) {
            break;
        }

        let response = match handle_command(desk, cmd).await {
            Ok(value) => json!({ "ok": value }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

async fn handle_command(desk: &EscalationDesk, cmd: IpcCommand) -> DeskResult<Value> {
    let prefs = &desk.preferences;
    let inbox = &desk.notifications;
    Ok(match cmd {
        IpcCommand::CreateEscalation { escalation } => to_value(desk.handle_escalation_created(&escalation).await?)?,
        IpcCommand::AssignManually { escalation_id, member_id } => {
            to_value(desk.assign_manually(&escalation_id, &member_id).await?)?
        }
        IpcCommand::RecordResponse { escalation_id } => to_value(desk.handle_response(&escalation_id).await?)?,
        IpcCommand::RecordResolution { escalation_id } => to_value(desk.handle_resolution(&escalation_id).await?)?,

        IpcCommand::Compliance { escalation_id } => to_value(desk.sla.check_compliance(&escalation_id)?)?,
        IpcCommand::BreachedSlas { team_id } => to_value(desk.sla.breached_slas(&team_id)?)?,
        IpcCommand::UpcomingBreaches { team_id, window_minutes } => {
            to_value(desk.sla.upcoming_breaches(&team_id, window_minutes)?)?
        }
        IpcCommand::TeamMetrics { team_id, days_back } => to_value(desk.sla.team_sla_metrics(&team_id, days_back)?)?,

        IpcCommand::Workload { team_id } => to_value(desk.balancer.snapshot(&team_id)?)?,
        IpcCommand::Balance { team_id } => {
            let team = desk.store().team(&team_id)?;
            to_value(desk.balancer.workload_balance(&team.member_ids)?)?
        }
        IpcCommand::PredictCapacity { team_id, additional } => {
            let team = desk.store().team(&team_id)?;
            to_value(desk.balancer.predict_capacity(&team_id, &team.member_ids, additional)?)?
        }

        IpcCommand::GetPreferences { recipient_id } => to_value(prefs.get_preferences(&recipient_id)?)?,
        IpcCommand::SavePreferences { preferences } => to_value(prefs.save_preferences(preferences)?)?,
        IpcCommand::SetChannel { recipient_id, channel, enabled } => {
            to_value(prefs.set_channel_enabled(&recipient_id, channel, enabled)?)?
        }
        IpcCommand::SetType { recipient_id, kind, enabled } => {
            to_value(prefs.set_notification_type_enabled(&recipient_id, kind, enabled)?)?
        }
        IpcCommand::SetQuietHours { recipient_id, channel, quiet_hours } => {
            to_value(prefs.set_quiet_hours(&recipient_id, channel, quiet_hours)?)?
        }
        IpcCommand::SetDnd { recipient_id, until } => to_value(prefs.set_do_not_disturb(&recipient_id, until)?)?,
        IpcCommand::DisableDnd { recipient_id } => to_value(prefs.disable_do_not_disturb(&recipient_id)?)?,
        IpcCommand::ResetPreferences { recipient_id } => to_value(prefs.reset_to_defaults(&recipient_id)?)?,

        IpcCommand::Send { payload } => to_value(desk.notify(&payload).await?)?,
        IpcCommand::SendToMany { recipients, payload } => results_json(desk.notify_many(&recipients, &payload).await),
        IpcCommand::SendByRole { role, payload } => results_json(desk.notify_role(&role, &payload).await?),
        IpcCommand::History { recipient_id, query } => to_value(inbox.history(&recipient_id, &query)?)?,
        IpcCommand::MarkRead { recipient_id, notification_id } => {
            json!({ "changed": inbox.mark_read(&recipient_id, &notification_id)? })
        }
        IpcCommand::MarkAllRead { recipient_id } => json!({ "changed": inbox.mark_all_read(&recipient_id)? }),
        IpcCommand::Archive { recipient_id, notification_id } => {
            json!({ "changed": inbox.archive(&recipient_id, &notification_id)? })
        }
        IpcCommand::Delete { recipient_id, notification_id } => {
            json!({ "changed": inbox.delete(&recipient_id, &notification_id)? })
        }
        IpcCommand::Counts { recipient_id } => to_value(inbox.counts(&recipient_id)?)?,
        IpcCommand::RecordAction { recipient_id, notification_id, action } => {
            json!({ "changed": inbox.record_action(&recipient_id, &notification_id, &action)? })
        }

        IpcCommand::Scan => to_value(desk.scan().await?)?,
        IpcCommand::Cleanup { days_to_keep } => {
            json!({ "removed": inbox.cleanup_old_notifications(days_to_keep)? })
        }
        IpcCommand::Events { subject_id } => to_value(desk.events_for(&subject_id)?)?,
        IpcCommand::Quit => Value::Null,
    })
}

fn to_value<T: serde::Serialize>(value: T) -> DeskResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn results_json(results: SendResults) -> Value {
    results
        .into_iter()
        .map(|(recipient, result)| {
            let entry = match result {
                Ok(record) => json!({ "ok": record }),
                Err(e) => json!({ "error": e.to_string() }),
            };
            (recipient, entry)
        })
        .collect::<serde_json::Map<_, _>>()
        .into()
}

fn print_summary(desk: &EscalationDesk) -> Result<()> {
    println!("=== DESK SUMMARY ===");
    let teams = desk.store().list_teams()?;
    if teams.is_empty() {
        println!("  (No teams configured)");
    }
    for team in teams {
        let balance = desk.balancer.workload_balance(&team.member_ids)?;
        let metrics = desk.sla.team_sla_metrics(&team.team_id, 30)?;
        let open: u32 = balance.loads.iter().map(|(_, l)| *l).sum();
        println!(
            "  {} | open: {open} | variance: {:.2} | SLA 30d: {:.1}% ({} breached of {})",
            team.name, balance.variance, metrics.compliance_rate, metrics.breached, metrics.total
        );
    }
    println!("  pending manual: {}", desk.store().list_pending()?.len());
    Ok(())
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
