use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::resources::{connect_storage, resolve_config};
use super::RunArgs;
use crate::config::Config;
use crate::fixture::{Resources, StorageFixture};
use crate::host::{FunctionHost, LogBuffer};
use crate::invoke::FunctionInvoker;
use crate::poll::{wait_until_cancellable, RetryPolicy};
use crate::scenarios::{run_scenarios, Harness, Scenario, ScenarioError};
use crate::storage::StorageBackend;

const REACHABLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct RunReport {
    passed: usize,
    failed: usize,
    scenarios: Vec<ScenarioReport>,
}

#[derive(Debug, Serialize)]
struct ScenarioReport {
    name: &'static str,
    passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn build_report(results: &[(Scenario, Result<(), ScenarioError>)]) -> RunReport {
    let scenarios: Vec<_> = results
        .iter()
        .map(|(scenario, result)| ScenarioReport {
            name: scenario.name(),
            passed: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        })
        .collect();
    let passed = scenarios.iter().filter(|s| s.passed).count();
    RunReport {
        passed,
        failed: scenarios.len() - passed,
        scenarios,
    }
}

pub async fn execute_run(args: RunArgs) -> Result<()> {
    let mut config = resolve_config(&args.resources)?;
    if let Some(timeout_ms) = args.timeout_ms {
        config.poll.timeout_ms = timeout_ms;
    }
    let policy = config.poll.policy()?;

    let root = CancellationToken::new();
    let on_signal = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling outstanding polls");
            on_signal.cancel();
        }
    });

    eprintln!("==> Preparing storage");
    let storage = connect_storage(&config)?;
    run_suite(&args, &config, policy, &root, storage).await
}

/// Everything after storage is connected. Resources are torn down on every
/// path past setup unless `--keep-resources` is given.
async fn run_suite(
    args: &RunArgs,
    config: &Config,
    policy: RetryPolicy,
    root: &CancellationToken,
    storage: Arc<dyn StorageBackend>,
) -> Result<()> {
    let scenarios: Vec<Scenario> = if args.scenarios.is_empty() {
        Scenario::all().to_vec()
    } else {
        args.scenarios.clone()
    };

    let fixture = StorageFixture::setup(
        storage,
        Resources::with_suffix(&config.resources.suffix),
        root,
    )
    .await
    .context("Failed to create shared resources")?;

    let outcome = run_with_host(args, config, policy, root, &fixture, &scenarios).await;

    let teardown = if args.keep_resources {
        eprintln!("==> Keeping shared resources");
        Ok(())
    } else {
        eprintln!("==> Deleting shared resources");
        fixture.teardown().await
    };
    let results = outcome?;
    teardown.context("Failed to delete shared resources")?;

    let mut failures = Vec::new();
    for (scenario, result) in &results {
        match result {
            Ok(()) => eprintln!("    PASS {}", scenario),
            Err(e) => {
                eprintln!("    FAIL {}: {}", scenario, e);
                failures.push(scenario.name());
            }
        }
    }

    if let Some(path) = &args.report {
        let report = serde_json::to_string_pretty(&build_report(&results))?;
        std::fs::write(path, report)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        eprintln!("==> Report written to {}", path.display());
    }

    if !failures.is_empty() {
        bail!(
            "{} of {} scenario(s) failed: {}",
            failures.len(),
            results.len(),
            failures.join(", ")
        );
    }
    eprintln!("All {} scenario(s) passed", results.len());
    Ok(())
}

/// Start the host if asked, wait until it answers, then run the scenarios.
/// The host is stopped on every path; the fixture is left to the caller.
async fn run_with_host(
    args: &RunArgs,
    config: &Config,
    policy: RetryPolicy,
    root: &CancellationToken,
    fixture: &StorageFixture,
    scenarios: &[Scenario],
) -> Result<Vec<(Scenario, Result<(), ScenarioError>)>> {
    let (sink, logs) = LogBuffer::new();
    let mut host = None;
    if args.start_host {
        eprintln!("==> Starting function host: {}", config.host.command);
        host = Some(FunctionHost::start(&config.host, sink)?);
    } else {
        warn!("host output is not captured without --start-host; log checks will time out");
        drop(sink);
    }

    let results = async {
        if let Some(host) = host.as_mut() {
            let startup = policy.with_timeout(config.host.startup_timeout());
            host.wait_ready(&startup, root, &config.host.ready_line)
                .await
                .context("Function host did not become ready")?;
        }

        let invoker =
            FunctionInvoker::new(&config.host.base_url, config.host.function_key.clone())?;
        eprintln!("==> Waiting for {}", invoker.base_url());
        let reach = policy.with_timeout(REACHABLE_TIMEOUT);
        wait_until_cancellable(
            &reach,
            root,
            || invoker.is_reachable(),
            || format!("function host at {}", config.host.base_url),
        )
        .await
        .context("Function host is not reachable")?;

        eprintln!("==> Running {} scenario(s)", scenarios.len());
        let harness = Harness::new(fixture, invoker, logs, policy);
        Ok::<_, anyhow::Error>(run_scenarios(&harness, scenarios).await)
    }
    .await;

    if let Some(host) = host {
        if let Err(e) = host.stop().await {
            warn!(error = %e, "failed to stop function host");
        }
    }
    results
}
