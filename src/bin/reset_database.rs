use tourney_ops::error::Error;
use tourney_ops::{establish_connection, reset_database, run_migrations};

fn main() -> Result<(), Error> {
    let mut conn = establish_connection()?;
    run_migrations(&mut conn)?;
    reset_database(&mut conn)?;
    println!("Requests, scores, sessions, announcements and device tokens cleared; staff marked unavailable.");
    Ok(())
}
