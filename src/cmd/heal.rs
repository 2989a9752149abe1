//! `conductor heal`.

use conductor::errors::Result;
use conductor::orchestrator::Conductor;
use conductor::orchestrator::heal::HealRequest;

use super::print_outcome;

pub async fn cmd_heal(
    conductor: &Conductor,
    error: &str,
    location: Option<String>,
    command: Option<String>,
    task: Option<String>,
    step: Option<String>,
) -> Result<()> {
    let request = HealRequest {
        error: error.to_string(),
        location,
        command,
        task,
        step,
    };
    let outcome = conductor.heal(&request).await?;
    print_outcome(&outcome, conductor.config.json)?;
    Ok(())
}
