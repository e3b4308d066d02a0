//! CLI command dispatch and handlers
//!
//! Routes parsed CLI arguments to the appropriate command handler.

pub mod serve;
pub mod version;

use tokio_util::sync::CancellationToken;

use crate::cli::args::{Cli, Commands};
use crate::error::{ExitCode, HostError};

/// Dispatch a parsed CLI invocation to the appropriate command handler.
///
/// Returns the process exit code on success.
///
/// # Errors
///
/// Returns an error if the dispatched command handler fails.
pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<i32, HostError> {
    match cli.command {
        Commands::Serve(args) => serve::run(&args, cancel).await,
        Commands::Version(args) => {
            version::run(&args)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
