//! Read-through directory of identity-layer roles.

use super::DeskStore;
use crate::{error::DeskResult, repository::RecipientDirectory, types::RecipientId};
use rusqlite::params;

impl DeskStore {
    pub fn add_directory_role(&self, user_id: &str, role: &str) -> DeskResult<()> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO directory_user (user_id, role) VALUES (?1, ?2)",
            params![user_id, role],
        )?;
        Ok(())
    }

    pub fn remove_directory_role(&self, user_id: &str, role: &str) -> DeskResult<()> {
        self.lock()?.execute(
            "DELETE FROM directory_user WHERE user_id = ?1 AND role = ?2",
            params![user_id, role],
        )?;
        Ok(())
    }
}

impl RecipientDirectory for DeskStore {
    fn recipients_with_role(&self, role: &str) -> DeskResult<Vec<RecipientId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT user_id FROM directory_user WHERE role = ?1 ORDER BY user_id")?;
        let ids = stmt
            .query_map(params![role], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}
