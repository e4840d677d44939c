use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use sandpit::cli::{Cli, Command};
use sandpit::config::{self, Config};
use sandpit::error::SandpitError;
use sandpit::events::{EventSink, TracingSink};
use sandpit::executor::{AgentExecutor, ExecutionRequest, ExecutionResult};
use sandpit::guest::GuestChannel;
use sandpit::guest::sim::SimChannel;
use sandpit::hypervisor::Hypervisor;
use sandpit::hypervisor::sim::SimHypervisor;
use sandpit::pool::VmPool;
use sandpit::snapshot::SnapshotManager;
use sandpit::{logging, paths};

/// Boot delay of the in-memory hypervisor.
const SIM_BOOT_DELAY: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let log_file = logging::init(cli.verbose);
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Command::Check => print_summary(&cli.config, &config)?,
        Command::Serve { simulate } => {
            let path = paths::log_file();
            if let Err(e) = log_file.open(&path) {
                tracing::warn!(path = %path.display(), error = %e, "file logging disabled");
            }
            serve(&config, simulate).await?
        }
        Command::Exec {
            script,
            timeout_ms,
            files,
        } => {
            let code = read_script(&script)?;
            let mut request = ExecutionRequest::new(code, Duration::from_millis(timeout_ms));
            request.workspace_files = files;
            let result = exec(&config, request).await?;
            std::process::exit(report(&result));
        }
    }

    Ok(())
}

fn print_summary(path: &Path, config: &Config) -> Result<(), SandpitError> {
    let settings = config.pool_settings()?;
    let retention = config.retention();
    let exec = config.executor_settings();
    println!("{}: ok", path.display());
    println!(
        "  vm:       {} vcpu, {} MiB, {} GiB, {}",
        settings.resources.vcpu,
        settings.resources.memory_mib,
        settings.resources.disk_gib,
        settings.network_mode
    );
    println!(
        "  pool:     min {}, max {}, ttl {}s",
        settings.min_size,
        settings.max_size,
        settings.ttl.as_secs()
    );
    println!(
        "  snapshot: max age {}, max count {}",
        retention
            .max_age
            .map_or("unlimited".to_string(), |d| format!("{}s", d.as_secs())),
        retention
            .max_count
            .map_or("unlimited".to_string(), |n| n.to_string())
    );
    println!(
        "  executor: cancel grace {}ms, output cap {} bytes",
        exec.cancel_grace.as_millis(),
        exec.output_cap
    );
    println!("  libvirt:  {}", config.advanced.libvirt_uri);
    Ok(())
}

fn read_script(path: &PathBuf) -> Result<Vec<u8>, SandpitError> {
    let mut code = Vec::new();
    if path.as_os_str() == "-" {
        std::io::stdin()
            .read_to_end(&mut code)
            .map_err(|source| SandpitError::Io {
                context: "reading script from stdin".into(),
                source,
            })?;
    } else {
        code = std::fs::read(path).map_err(|source| SandpitError::Io {
            context: format!("reading script {}", path.display()),
            source,
        })?;
    }
    Ok(code)
}

fn connect(config: &Config, simulate: bool) -> Result<Arc<dyn Hypervisor>, SandpitError> {
    if simulate {
        return Ok(Arc::new(SimHypervisor::new(SIM_BOOT_DELAY)));
    }
    #[cfg(feature = "libvirt")]
    {
        let uri = &config.advanced.libvirt_uri;
        let hv = sandpit::hypervisor::libvirt::LibvirtHypervisor::connect(uri)
            .map_err(|e| SandpitError::hypervisor(format!("failed to connect to {uri}"), e))?;
        Ok(Arc::new(hv))
    }
    #[cfg(not(feature = "libvirt"))]
    {
        let _ = config;
        Err(SandpitError::Validation {
            message: "sandpit was built without the `libvirt` feature; use --simulate".into(),
        })
    }
}

async fn serve(config: &Config, simulate: bool) -> Result<(), SandpitError> {
    let hypervisor = connect(config, simulate)?;
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let snapshots = Arc::new(SnapshotManager::new(
        hypervisor.clone(),
        events.clone(),
        config.retention(),
    ));
    let pool = VmPool::start(
        config.pool_settings()?,
        hypervisor,
        snapshots,
        Arc::new(config.template()),
        events,
    );

    let interval = pool.settings().health_check_interval;
    let mut report = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let s = pool.status();
                tracing::info!(
                    warming = s.warming,
                    available = s.available,
                    in_use = s.in_use,
                    unhealthy = s.unhealthy,
                    "pool status"
                );
            }
        }
    }

    tracing::info!("interrupted, shutting down pool");
    pool.shutdown().await;
    Ok(())
}

async fn exec(config: &Config, request: ExecutionRequest) -> Result<ExecutionResult, SandpitError> {
    let hv = Arc::new(SimHypervisor::new(SIM_BOOT_DELAY));
    let hypervisor: Arc<dyn Hypervisor> = hv.clone();
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let snapshots = Arc::new(SnapshotManager::new(
        hypervisor.clone(),
        events.clone(),
        config.retention(),
    ));
    let pool = Arc::new(VmPool::start(
        config.pool_settings()?,
        hypervisor,
        snapshots,
        Arc::new(config.template()),
        events.clone(),
    ));
    let channel: Arc<dyn GuestChannel> = Arc::new(SimChannel::new(hv));
    let executor = AgentExecutor::new(pool.clone(), channel, events, config.executor_settings());

    let ctx = CancellationToken::new();
    let result = executor.execute(&ctx, request).await;
    pool.shutdown().await;
    result
}

/// Print the result and pick the process exit code: the guest's own
/// status, 124 on timeout, 125 on transport failure.
fn report(result: &ExecutionResult) -> i32 {
    use std::io::Write;

    let _ = std::io::stdout().write_all(&result.stdout);
    let _ = std::io::stderr().write_all(&result.stderr);
    if result.stdout_truncated || result.stderr_truncated {
        eprintln!("[output truncated]");
    }
    if let Some(e) = result.transport_failure() {
        eprintln!("{:?}", miette::Report::new(e));
    }
    if result.timed_out {
        eprintln!("timed out after {:?} on {}", result.duration, result.vm);
    }
    match result.exit_code {
        Some(code) => code,
        None if result.timed_out || result.cancelled => 124,
        None => 125,
    }
}
