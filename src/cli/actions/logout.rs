use crate::cli::globals::GlobalArgs;
use anyhow::Result;

/// Clears the persisted session. Running it twice is harmless.
/// # Errors
/// Returns an error if the configuration is invalid.
pub fn execute(globals: &GlobalArgs) -> Result<()> {
    let (client, _events) = globals.connect()?;
    client.store().logout();
    println!("Logged out");
    Ok(())
}
