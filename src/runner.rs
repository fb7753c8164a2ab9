use anyhow::{Context, Result};
use rayon::prelude::*;
use std::time::Instant;

use crate::client::Toolchain;
use crate::config::{EnvConfig, HarnessConfig};
use crate::fixture::GroupFixture;
use crate::log;
use crate::report::{RunReport, ScenarioOutcome};
use crate::saved_state;
use crate::scenario::{self, GroupContext, Scenario, Suite};

/// Build the saved state once, run every scenario against it, and tear the
/// group down in reverse order of construction. A failed build marks every
/// scenario not-run; it is never retried or replaced.
pub fn run(cfg: &HarnessConfig, suite: &Suite) -> Result<RunReport> {
    let tools = Toolchain::from_config(cfg)?;
    let strategy = saved_state::strategy_for(&cfg.saved_state);
    let corpus = suite.corpus()?;
    let mut report = RunReport::new(strategy.kind());

    log::debug(&format!(
        "server={} client={} strategy={} jobs={}",
        tools.server.display(),
        tools.client.display(),
        strategy.kind().label(),
        cfg.run.jobs
    ));

    let mut group = match GroupFixture::allocate(&cfg.env, &tools.server) {
        Ok(g) => g,
        Err(e) => return Ok(abort(report, suite, e)),
    };
    log::debug(&format!("PATH={}", group.env().get("PATH").unwrap_or_default()));
    if log::verbosity() > 1 {
        for (k, v) in group.env().iter() {
            log::debug(&format!("env {}={}", k, v));
        }
    }

    let artifact = match saved_state::build(&mut group, &tools, strategy.as_ref(), corpus) {
        Ok(a) => a,
        Err(e) => {
            let report = abort(report, suite, e);
            if let Err(e) = group.teardown() {
                log::warn(&format!("group teardown failed: {:#}", e));
            }
            return Ok(report);
        }
    };
    report.artifact_fingerprint = Some(format!("{:016x}", artifact.fingerprint));

    let ctx = GroupContext {
        tools: &tools,
        strategy: strategy.as_ref(),
        artifact: &artifact,
        corpus,
        backoff: cfg.timing.backoff(),
        stop_grace: cfg.timing.stop_grace(),
    };
    report.outcomes = run_scenarios(&ctx, &cfg.env, &group, &suite.scenarios, cfg.run.jobs)?;

    if let Err(e) = artifact.verify_unchanged() {
        report.group_errors.push(format!("{:#}", e));
    }
    if let Err(e) = group.teardown() {
        report.group_errors.push(format!("{:#}", e));
    }
    Ok(report)
}

fn abort(mut report: RunReport, suite: &Suite, err: anyhow::Error) -> RunReport {
    log::warn(&format!("aborting group: {:#}", err));
    report.group_errors.push(format!("{:#}", err));
    report.outcomes = suite
        .scenarios
        .iter()
        .map(|s| ScenarioOutcome::not_run(&s.name))
        .collect();
    report
}

fn run_scenarios(
    ctx: &GroupContext<'_>,
    env_cfg: &EnvConfig,
    group: &GroupFixture,
    scenarios: &[Scenario],
    jobs: usize,
) -> Result<Vec<ScenarioOutcome>> {
    if jobs <= 1 {
        return Ok(scenarios
            .iter()
            .map(|s| run_one(ctx, env_cfg, group, s))
            .collect());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("Failed to build scenario thread pool")?;
    // par_iter().collect() keeps input order, so the report order is stable.
    Ok(pool.install(|| {
        scenarios
            .par_iter()
            .map(|s| run_one(ctx, env_cfg, group, s))
            .collect()
    }))
}

fn run_one(ctx: &GroupContext<'_>, env_cfg: &EnvConfig, group: &GroupFixture, scenario: &Scenario) -> ScenarioOutcome {
    let start = Instant::now();
    log::log(&format!("scenario {}", scenario.name));

    let mut failures = Vec::new();
    match group.allocate_test(env_cfg) {
        Ok(fixture) => {
            log::debug(&format!(
                "[{}] repo={} server_tmp={}",
                scenario.name,
                fixture.repo().display(),
                fixture.server_tmp().display()
            ));
            failures.extend(scenario::execute(ctx, scenario, &fixture));
            if let Err(e) = fixture.teardown() {
                failures.push(e.context("deleting working repo"));
            }
        }
        Err(e) => failures.push(e),
    }

    let elapsed = start.elapsed().as_millis() as u64;
    if failures.is_empty() {
        log::debug(&format!("scenario {} passed in {}ms", scenario.name, elapsed));
    } else {
        log::warn(&format!("scenario {} failed", scenario.name));
    }
    ScenarioOutcome::from_failures(&scenario.name, failures, elapsed)
}
