//! Notification preference records, stored whole as JSON.

use super::{json_col, ms, to_json, DeskStore};
use crate::{
    error::DeskResult, notification_preferences::NotificationPreferences, repository::PreferenceRepository,
};
use rusqlite::{params, OptionalExtension};

impl PreferenceRepository for DeskStore {
    fn load_preferences(&self, recipient_id: &str) -> DeskResult<Option<NotificationPreferences>> {
        Ok(self
            .lock()?
            .query_row(
                "SELECT preferences FROM notification_preferences WHERE recipient_id = ?1",
                params![recipient_id],
                |r| json_col(0, &r.get::<_, String>(0)?),
            )
            .optional()?)
    }

    fn save_preferences(&self, prefs: &NotificationPreferences) -> DeskResult<()> {
        let updated_at = prefs.updated_at.map(ms).unwrap_or(0);
        self.lock()?.execute(
            "INSERT OR REPLACE INTO notification_preferences (recipient_id, preferences, updated_at)
             VALUES (?1, ?2, ?3)",
            params![prefs.recipient_id, to_json(prefs)?, updated_at],
        )?;
        Ok(())
    }

    fn delete_preferences(&self, recipient_id: &str) -> DeskResult<()> {
        self.lock()?.execute(
            "DELETE FROM notification_preferences WHERE recipient_id = ?1",
            params![recipient_id],
        )?;
        Ok(())
    }
}
