use chrono::Utc;
use diesel::prelude::*;
use diesel::SqliteConnection;

use crate::error::Error;
use crate::model::{Announcement, NewAnnouncement};
use crate::schema::announcements;

pub const MAX_TITLE_LEN: usize = 120;

/// Stores an announcement. Delivery is the caller's job.
pub fn create_announcement(
    conn: &mut SqliteConnection,
    title: &str,
    body: &str,
) -> Result<Announcement, Error> {
    let title = title.trim();
    let body = body.trim();
    if title.is_empty() || body.is_empty() {
        return Err(Error::Validation("title and body are required".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(Error::Validation(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }

    let announcement = diesel::insert_into(announcements::table)
        .values(&NewAnnouncement {
            title,
            body,
            created_at: Utc::now().naive_utc(),
        })
        .returning(Announcement::as_returning())
        .get_result(conn)?;
    Ok(announcement)
}

/// All announcements, newest first.
pub fn list_announcements(conn: &mut SqliteConnection) -> Result<Vec<Announcement>, Error> {
    Ok(announcements::table
        .order((announcements::created_at.desc(), announcements::id.desc()))
        .select(Announcement::as_select())
        .load(conn)?)
}
