//! Version information display
//!
//! Prints version metadata in human or JSON format.

use crate::cli::args::{OutputFormat, VersionArgs};
use crate::config::DEFAULT_SERVER_NAME;
use crate::error::HostError;
use crate::host::VersionInfo;

/// Print version information.
///
/// # Errors
///
/// Returns an error if the JSON form cannot be serialized.
pub fn run(args: &VersionArgs) -> Result<(), HostError> {
    let info = VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        name: DEFAULT_SERVER_NAME.to_string(),
    };

    match args.format {
        OutputFormat::Human => println!("{} {}", info.name, info.version),
        OutputFormat::Json => println!("{}", serde_json::to_string(&info)?),
    }
    Ok(())
}
