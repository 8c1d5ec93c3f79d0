//! Error display for the CLI.

use colored::Colorize;
use hvctl_orchestrator::Error;

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    // Check for specific error types and provide hints
    let Some(engine_err) = err.downcast_ref::<Error>() else {
        return;
    };
    match engine_err {
        Error::Aggregate(failures) => {
            eprintln!(
                "\n{}",
                format!(
                    "Hint: {} hypervisor group(s) completed; rerun after fixing the failed ones.",
                    failures.succeeded
                )
                .yellow()
            );
        }
        Error::Config(_) | Error::Topology(_) => {
            eprintln!(
                "\n{}",
                "Hint: Check the topology file and hypervisor params.".yellow()
            );
        }
        Error::ReachabilityTimeout { .. } => {
            eprintln!(
                "\n{}",
                "Hint: Raise HVCTL_SSH_WAIT_TIMEOUT_SECS for slow guests.".yellow()
            );
        }
        Error::Remote { host, .. } => {
            eprintln!(
                "\n{}",
                format!("Hint: Check SSH access to {host}.").yellow()
            );
        }
        _ => {}
    }
}
