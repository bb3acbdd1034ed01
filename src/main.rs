use eyre::{Result, WrapErr};
use h2recon::scan::TlsProber;
use h2recon::{AppState, Host, ScanTask, TaskQueueRegistry, cli, logging, pretty, scan};
use std::sync::Arc;
use std::time::Duration;

/// Resolves after two consecutive idle observations one poll interval apart.
async fn wait_until_drained(state: &AppState, poll_interval: Duration) {
    let mut idle_polls = 0;
    while idle_polls < 2 {
        tokio::time::sleep(poll_interval).await;
        if state.is_idle() {
            idle_polls += 1;
        } else {
            idle_polls = 0;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();
    logging::init_logging(cli.verbose, cli.log_file.as_deref())?;
    cli.validate()?;

    log::info!("[main] starting: host={} port={} depth={} timeout={}s kinds={:?}",
        cli.host, cli.port, cli.depth, cli.timeout, cli.kinds());

    let host = Host::parse(&cli.host, cli.port)?;
    let poll_interval = Duration::from_secs(cli.poll_interval);
    let state = Arc::new(AppState::new(TaskQueueRegistry::default()));

    let prober = TlsProber::new().wrap_err("Failed to build TLS client configuration")?;
    let scanners = scan::create_default_scanners(prober, cli.concurrency, poll_interval);
    let workers = scan::spawn_scanner_tasks(scanners, Arc::clone(&state));

    let output = pretty::open_report(cli.out.as_deref()).wrap_err("Failed to open report output")?;
    let feed = state.outcomes.subscribe();
    let reporter = tokio::spawn(pretty::report_outcomes(feed, output));

    for kind in cli.kinds() {
        let task = ScanTask::new(kind, host.clone(), cli.timeout, cli.depth);
        state
            .queues
            .enqueue(kind, task)
            .wrap_err_with(|| format!("Failed to schedule {} scan", kind))?;
        log::debug!("[main] scheduled: kind={} host={}", kind, host);
    }

    if cli.once {
        tokio::select! {
            _ = wait_until_drained(&state, poll_interval) => {
                log::info!("[main] drained: all queues empty and workers idle");
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("[main] interrupted");
            }
        }
    } else {
        tokio::signal::ctrl_c().await.wrap_err("Failed to listen for ctrl-c")?;
        log::info!("[main] interrupted");
    }

    state.shutdown();
    for worker in workers {
        if let Err(e) = worker.await {
            log::error!("[main] worker_join_failed: error={}", e);
        }
    }

    // Dropping the last sender closes the feed and ends the reporter.
    let written = match Arc::try_unwrap(state) {
        Ok(state) => {
            pretty::print_status_table(&state.outcomes.snapshot());
            drop(state);
            reporter.await.unwrap_or(0)
        }
        Err(state) => {
            log::warn!("[main] state_still_shared: refs={}", Arc::strong_count(&state));
            reporter.abort();
            0
        }
    };
    log::info!("[main] finished: reported={}", written);
    Ok(())
}
