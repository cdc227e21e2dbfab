//! Notification inbox queries.

use super::{at, enum_col, json_col, ms, opt_at, opt_ms, to_json, DeskStore};
use crate::{
    error::DeskResult,
    notification_dispatcher::{DeliveryOutcome, HistoryQuery, NotificationCounts, NotificationRecord, SkipReason},
    notification_preferences::{Channel, NotificationPriority, NotificationType},
    repository::NotificationRepository,
    types::RecipientId,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::collections::BTreeMap;

const NOTIFICATION_COLS: &str = "notification_id, recipient_id, kind, priority, title, message,
     escalation_id, action_url, data, created_at, skip_reason, deliveries,
     read_at, archived_at, deleted_at, action_taken, action_at";

fn notification_row(r: &Row) -> rusqlite::Result<NotificationRecord> {
    let skip_reason: Option<String> = r.get(10)?;
    Ok(NotificationRecord {
        notification_id: r.get(0)?,
        recipient_id: r.get(1)?,
        kind: enum_col(2, &r.get::<_, String>(2)?, NotificationType::parse)?,
        priority: enum_col(3, &r.get::<_, String>(3)?, NotificationPriority::parse)?,
        title: r.get(4)?,
        message: r.get(5)?,
        escalation_id: r.get(6)?,
        action_url: r.get(7)?,
        data: json_col(8, &r.get::<_, String>(8)?)?,
        created_at: at(r.get(9)?),
        skip_reason: skip_reason.map(|s| enum_col(10, &s, SkipReason::parse)).transpose()?,
        deliveries: json_col(11, &r.get::<_, String>(11)?)?,
        read_at: opt_at(r.get(12)?),
        archived_at: opt_at(r.get(13)?),
        deleted_at: opt_at(r.get(14)?),
        action_taken: r.get(15)?,
        action_at: opt_at(r.get(16)?),
    })
}

impl NotificationRepository for DeskStore {
    fn insert_notification(&self, n: &NotificationRecord) -> DeskResult<()> {
        self.lock()?.execute(
            &format!(
                "INSERT INTO notification ({NOTIFICATION_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                n.notification_id,
                n.recipient_id,
                n.kind.as_str(),
                n.priority.as_str(),
                n.title,
                n.message,
                n.escalation_id,
                n.action_url,
                to_json(&n.data)?,
                ms(n.created_at),
                n.skip_reason.map(|s| s.as_str()),
                to_json(&n.deliveries)?,
                opt_ms(n.read_at),
                opt_ms(n.archived_at),
                opt_ms(n.deleted_at),
                n.action_taken,
                opt_ms(n.action_at),
            ],
        )?;
        Ok(())
    }

    fn attach_deliveries(
        &self,
        notification_id: &str,
        deliveries: &BTreeMap<Channel, DeliveryOutcome>,
    ) -> DeskResult<()> {
        self.lock()?.execute(
            "UPDATE notification SET deliveries = ?1 WHERE notification_id = ?2",
            params![to_json(deliveries)?, notification_id],
        )?;
        Ok(())
    }

    fn notification(&self, recipient_id: &str, notification_id: &str) -> DeskResult<Option<NotificationRecord>> {
        Ok(self
            .lock()?
            .query_row(
                &format!(
                    "SELECT {NOTIFICATION_COLS} FROM notification
                     WHERE recipient_id = ?1 AND notification_id = ?2"
                ),
                params![recipient_id, notification_id],
                notification_row,
            )
            .optional()?)
    }

    fn notifications_for(&self, recipient_id: &str, query: &HistoryQuery) -> DeskResult<Vec<NotificationRecord>> {
        let mut sql = format!(
            "SELECT {NOTIFICATION_COLS} FROM notification
             WHERE recipient_id = ?1 AND deleted_at IS NULL"
        );
        let mut args: Vec<String> = vec![recipient_id.to_string()];
        if !query.include_archived {
            sql.push_str(" AND archived_at IS NULL");
        }
        if query.unread_only {
            sql.push_str(" AND read_at IS NULL");
        }
        if let Some(kind) = query.kind {
            sql.push_str(" AND kind = ?2");
            args.push(kind.as_str().to_string());
        }
        sql.push_str(" ORDER BY created_at DESC, notification_id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), notification_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn notification_counts(&self, recipient_id: &str) -> DeskResult<NotificationCounts> {
        let conn = self.lock()?;
        let (total, archived): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(archived_at IS NOT NULL), 0)
             FROM notification WHERE recipient_id = ?1 AND deleted_at IS NULL",
            params![recipient_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM notification
             WHERE recipient_id = ?1 AND read_at IS NULL AND archived_at IS NULL
               AND deleted_at IS NULL AND skip_reason IS NULL
             GROUP BY kind",
        )?;
        let mut unread_by_type = BTreeMap::new();
        let mut unread = 0u32;
        let rows = stmt.query_map(params![recipient_id], |r| {
            Ok((enum_col(0, &r.get::<_, String>(0)?, NotificationType::parse)?, r.get::<_, u32>(1)?))
        })?;
        for row in rows {
            let (kind, n) = row?;
            unread += n;
            unread_by_type.insert(kind, n);
        }

        Ok(NotificationCounts {
            total: total as u32,
            unread,
            archived: archived as u32,
            unread_by_type,
        })
    }

    fn mark_read(&self, recipient_id: &str, notification_id: &str, read_at: DateTime<Utc>) -> DeskResult<usize> {
        Ok(self.lock()?.execute(
            "UPDATE notification SET read_at = ?3
             WHERE recipient_id = ?1 AND notification_id = ?2 AND read_at IS NULL",
            params![recipient_id, notification_id, ms(read_at)],
        )?)
    }

    fn mark_all_read(&self, recipient_id: &str, read_at: DateTime<Utc>) -> DeskResult<usize> {
        Ok(self.lock()?.execute(
            "UPDATE notification SET read_at = ?2
             WHERE recipient_id = ?1 AND read_at IS NULL AND deleted_at IS NULL",
            params![recipient_id, ms(read_at)],
        )?)
    }

    fn archive(&self, recipient_id: &str, notification_id: &str, archived_at: DateTime<Utc>) -> DeskResult<usize> {
        Ok(self.lock()?.execute(
            "UPDATE notification SET archived_at = ?3
             WHERE recipient_id = ?1 AND notification_id = ?2 AND archived_at IS NULL",
            params![recipient_id, notification_id, ms(archived_at)],
        )?)
    }

    fn soft_delete(&self, recipient_id: &str, notification_id: &str, deleted_at: DateTime<Utc>) -> DeskResult<usize> {
        Ok(self.lock()?.execute(
            "UPDATE notification SET deleted_at = ?3
             WHERE recipient_id = ?1 AND notification_id = ?2 AND deleted_at IS NULL",
            params![recipient_id, notification_id, ms(deleted_at)],
        )?)
    }

    fn record_action(
        &self,
        recipient_id: &str,
        notification_id: &str,
        action: &str,
        action_at: DateTime<Utc>,
    ) -> DeskResult<usize> {
        Ok(self.lock()?.execute(
            "UPDATE notification SET action_taken = ?3, action_at = ?4
             WHERE recipient_id = ?1 AND notification_id = ?2 AND action_taken IS NULL",
            params![recipient_id, notification_id, action, ms(action_at)],
        )?)
    }

    fn recipients_with_expired(&self, cutoff: DateTime<Utc>) -> DeskResult<Vec<RecipientId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT recipient_id FROM notification
             WHERE created_at < ?1 AND (archived_at IS NOT NULL OR deleted_at IS NOT NULL)
             ORDER BY recipient_id",
        )?;
        let ids = stmt
            .query_map(params![ms(cutoff)], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn delete_expired_batch(&self, recipient_id: &str, cutoff: DateTime<Utc>, limit: usize) -> DeskResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM notification WHERE notification_id IN (
                SELECT notification_id FROM notification
                WHERE recipient_id = ?1 AND created_at < ?2
                  AND (archived_at IS NOT NULL OR deleted_at IS NOT NULL)
                ORDER BY created_at ASC
                LIMIT ?3
             )",
            params![recipient_id, ms(cutoff), limit as i64],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}
