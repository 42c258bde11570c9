//! gpbackup_helper - per-segment data mover for COPY ... ON SEGMENT.

use clap::Parser;
use segment_helper::agent::{self, Agent};
use segment_helper::daemon::shutdown::{ShutdownCoordinator, ShutdownSignal};
use segment_helper::pipe::PipeManager;
use segment_helper::utils::{self, errors::EXIT_SUCCESS};
use segment_helper::{HelperArgs, HelperConfig, HelperError, VERSION};
use std::sync::Arc;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = HelperArgs::parse();
    if args.version {
        println!("gpbackup_helper version {}", VERSION);
        return;
    }

    if let Err(e) = utils::logger::init(&args.log_level, args.log_file.as_deref()) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let config = match HelperConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            if let Some(pipe_file) = &args.pipe_file {
                agent::write_error_file(pipe_file);
            }
            std::process::exit(e.exit_code());
        }
    };

    let pipe_base = config.pipe_file.clone();
    let oids = match agent::read_oid_list(&config.oid_file) {
        Ok(oids) => oids,
        Err(e) => {
            tracing::error!("{}", e);
            agent::write_error_file(&pipe_base);
            std::process::exit(e.exit_code());
        }
    };

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    tracing::info!(
        host = %host,
        content = config.content,
        oids = oids.len(),
        "gpbackup_helper {} starting {:?} agent",
        VERSION,
        config.mode
    );

    let shutdown = ShutdownCoordinator::new();
    let pipes = Arc::new(PipeManager::new());
    let helper = Agent::new(config, pipes.clone(), shutdown.token());
    let batches = helper.batches();

    let result = tokio::select! {
        result = agent::run(&helper, &oids) => result,
        signal = shutdown.wait_for_signal() => {
            tracing::warn!(
                "Helper interrupted by {}",
                match signal {
                    ShutdownSignal::Interrupt => "SIGINT",
                    ShutdownSignal::Terminate => "SIGTERM",
                }
            );
            Err(HelperError::Interrupted)
        }
    };

    let code = match result {
        Ok(()) => {
            agent::cleanup(&pipe_base, &pipes, &oids, batches);
            EXIT_SUCCESS
        }
        Err(e) => {
            tracing::error!(content = helper.config.content, "{}", e);
            agent::write_error_file(&pipe_base);
            agent::cleanup(&pipe_base, &pipes, &oids, batches);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
