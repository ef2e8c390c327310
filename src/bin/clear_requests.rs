use tourney_ops::error::Error;
use tourney_ops::{clear_requests, establish_connection, run_migrations};

fn main() -> Result<(), Error> {
    let mut conn = establish_connection()?;
    run_migrations(&mut conn)?;
    let cleared = clear_requests(&mut conn)?;
    println!("Cleared {cleared} requests.");
    Ok(())
}
