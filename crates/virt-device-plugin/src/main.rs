use std::process::ExitCode;

use clap::Parser;
use utils::logging;
use utils::version;
use virt_device_plugin::app::Application;
use virt_device_plugin::config::Cli;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_global_hooks();

    let cli = Cli::parse();

    let _guard = match logging::init(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting virt device plugin {}", &**version::VERSION);

    match Application::new(cli).run().await {
        Ok(reason) if reason.is_graceful() => ExitCode::SUCCESS,
        Ok(reason) => {
            tracing::error!("device plugin stopped: {reason}");
            ExitCode::FAILURE
        }
        Err(report) => {
            tracing::error!("device plugin failed: {report:?}");
            ExitCode::FAILURE
        }
    }
}
