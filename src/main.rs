use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;

use distbuild::channel::{CompileRequest, TcpConnector};
use distbuild::config::SessionConfig;
use distbuild::error::DispatchError;
use distbuild::paths::{ProjectDirs, ProjectTree};
use distbuild::session::Session;
use distbuild::shutdown::install_shutdown_handler;
use distbuild::slave::declare::distributed_option;

/// Command line of the driver.
#[derive(Debug, Default)]
struct DriverArgs {
    slaves: Option<String>,
    project: String,
    jobs: Option<usize>,
    source_dirs: Vec<String>,
    object_dir: Option<String>,
    units: Vec<String>,
}

impl DriverArgs {
    fn parse(args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = DriverArgs {
            project: "default".to_string(),
            ..Default::default()
        };
        for arg in args {
            if let Some(list) = distributed_option(&arg) {
                parsed.slaves = Some(list.to_string());
            } else if let Some(name) = arg.strip_prefix("--project=") {
                parsed.project = name.to_string();
            } else if let Some(dir) = arg.strip_prefix("--src=") {
                parsed.source_dirs.push(dir.to_string());
            } else if let Some(dir) = arg.strip_prefix("--obj=") {
                parsed.object_dir = Some(dir.to_string());
            } else if let Some(n) = arg.strip_prefix("-j") {
                parsed.jobs = Some(n.parse().with_context(|| format!("invalid -j value {n:?}"))?);
            } else if arg.starts_with('-') {
                bail!("unknown option {arg}");
            } else {
                parsed.units.push(arg);
            }
        }
        Ok(parsed)
    }
}

fn compile_request(project: &str, unit: &str) -> CompileRequest {
    let path = Path::new(unit);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| unit.to_string());
    let language = match path.extension().and_then(|e| e.to_str()) {
        Some("adb" | "ads") => "ada",
        Some("cc" | "cpp" | "cxx") => "c++",
        _ => "c",
    };
    CompileRequest::new(project, language, format!("{stem}.o"), format!("{stem}.d"))
        .with_options(["-c", unit])
}

/// Dispatch every unit to a free remote slot, waiting for results in between.
async fn build(session: &Session, units: &[String]) -> anyhow::Result<()> {
    let report = session.register_all().await?;
    eprintln!(
        "   Slaves: {} active, {} failed, {} total slots",
        report.activated.len(),
        report.failed.len(),
        report.total_capacity
    );

    let mut events = session
        .take_events()
        .context("job events already taken")?;
    let mut pending: VecDeque<CompileRequest> = units
        .iter()
        .map(|unit| compile_request(session.project(), unit))
        .collect();
    let mut in_flight = 0usize;
    let mut failed = 0usize;

    while !pending.is_empty() || in_flight > 0 {
        if session.capacity().remote_free() > 0
            && let Some(request) = pending.pop_front()
        {
            let retry = request.clone();
            match session.run(request).await {
                Ok(_) => in_flight += 1,
                // A slave dropped since the capacity check; try again on fresh numbers.
                Err(DispatchError::NoFreeSlot { .. }) => pending.push_front(retry),
                Err(e) => {
                    tracing::error!(obj = %retry.obj_name, error = %e, "Dispatch failed");
                    failed += 1;
                }
            }
            continue;
        }

        if in_flight == 0 {
            eprintln!(
                "   {} unit(s) left for local compilation",
                pending.len()
            );
            break;
        }

        match events.recv().await {
            Some(event) => {
                in_flight -= 1;
                if event.outcome.is_success() {
                    eprintln!("   [{}] {} done", event.host, event.obj_name);
                } else {
                    failed += 1;
                    eprintln!("   [{}] {} FAILED: {:?}", event.host, event.obj_name, event.outcome);
                }
            }
            None => break,
        }
    }

    if failed > 0 {
        bail!("{failed} compilation(s) failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = DriverArgs::parse(std::env::args().skip(1))?;
    let mut config = SessionConfig::from_env()?;
    if let Some(jobs) = args.jobs {
        config.local_parallelism = jobs;
    }

    eprintln!("distbuild v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Project: {}", args.project);
    eprintln!("   Local jobs: {}", config.local_parallelism);

    let mut project = ProjectDirs::new(&args.project);
    for dir in &args.source_dirs {
        project = project.with_source_dir(dir);
    }
    if let Some(obj) = &args.object_dir {
        project = project.with_object_dir(obj);
    }
    let tree = ProjectTree::new().with_project(project);

    let shutdown = install_shutdown_handler();
    let session = Session::new(
        &args.project,
        config,
        Arc::new(TcpConnector::new()),
        Arc::new(tree),
    )
    .with_shutdown(&shutdown);

    // Declaration errors abort before any connection attempt.
    match &args.slaves {
        Some(list) => session.declare(list)?,
        None => session.declare_from_env()?,
    };

    run_session(&session, &args.units, &shutdown).await
}

/// Build, then clean up and tear down whatever the build outcome.
async fn run_session(
    session: &Session,
    units: &[String],
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let result = tokio::select! {
        r = build(session, units) => r,
        _ = shutdown.cancelled() => Err(anyhow::anyhow!("interrupted")),
    };

    // A no-op when no slave is Active.
    session.clean_up(session.project()).await;
    let teardown = session.unregister_all(shutdown.is_cancelled()).await;
    if !teardown.forced.is_empty() {
        eprintln!("   Forcibly closed: {}", teardown.forced.join(", "));
    }

    result
}
