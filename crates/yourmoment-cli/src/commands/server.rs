//! `server` subcommand.
//!
//! The HTTP API and the templated web UI are deployed separately; this
//! binary only hosts the background half of the system. The subcommand is
//! kept so the documented surface stays complete.

use super::CommandError;

pub fn execute() -> Result<(), CommandError> {
    println!(
        "The HTTP API is served by the separate API deployment.\n\
         This binary hosts the background side: run `yourmoment worker` and\n\
         `yourmoment scheduler` against the same database."
    );
    Ok(())
}
