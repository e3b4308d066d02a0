//! `toolhost` - protocol host for editor-facing tooling services

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use toolhost::cli::args::Cli;
use toolhost::cli::commands;
use toolhost::error::ExitCode;
use toolhost::observability::init_logging;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(ExitCode::USAGE_ERROR);
        }
        // --help and --version
        Err(e) => e.exit(),
    };

    if !cli.quiet {
        init_logging(cli.log_format, cli.verbose, cli.color);
    }

    let cancel = CancellationToken::new();
    // Exit code of the first signal received, 0 while none.
    let signalled = Arc::new(AtomicI32::new(0));

    {
        let cancel = cancel.clone();
        let signalled = Arc::clone(&signalled);
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to register SIGTERM handler");
                    return;
                }
            };

            let code = tokio::select! {
                _ = tokio::signal::ctrl_c() => ExitCode::INTERRUPTED,
                _ = sigterm.recv() => ExitCode::TERMINATED,
            };
            signalled.store(code, Ordering::SeqCst);
            tracing::warn!("shutting down gracefully (signal again to force)");
            cancel.cancel();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => std::process::exit(ExitCode::INTERRUPTED),
                _ = sigterm.recv() => std::process::exit(ExitCode::TERMINATED),
            }
        });
    }

    let result = commands::dispatch(cli, cancel).await;

    let signal_code = signalled.load(Ordering::SeqCst);
    match result {
        Ok(_) if signal_code != 0 => std::process::exit(signal_code),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
