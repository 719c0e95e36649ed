//! Runs one reconciliation: enumerate instances, read their key files, and write the artifacts.
//!
//! Only failures talking to the cluster manager abort a run. Missing or unreadable key files and
//! malformed key lines are logged and skipped, so one bad instance can't block the rest.

use crate::api::{Api, Backoff, ClusterClient, JobResult};
use crate::config::Config;
use crate::instance;
use crate::keyfile;
use crate::reconcile::Reconciler;
use crate::render;
use anyhow::Context;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Everything one run needs, constructed once per invocation.
pub struct RunContext<A: Api> {
    pub config: Config,
    pub api: A,
    pub backoff: Backoff,
}

impl RunContext<ClusterClient> {
    /// Builds a context that talks to the cluster manager named in `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let (user, password) = config.credentials()?;
        let api = ClusterClient::new(&config.ganeti_instance, user, password)
            .context("failed to set up the cluster manager client")?;
        Ok(RunContext {
            config,
            api,
            backoff: Backoff::default(),
        })
    }
}

impl<A: Api> RunContext<A> {
    pub fn new(config: Config, api: A) -> Self {
        RunContext {
            config,
            api,
            backoff: Backoff::default(),
        }
    }
}

/// What happened during a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Instances listed by the cluster manager.
    pub instances: usize,

    /// Instances whose key file was missing or unreadable.
    pub skipped: Vec<String>,

    /// Accounts written to the artifacts.
    pub users: usize,

    /// Duplicate-key and key-mismatch reports.
    pub conflicts: usize,

    /// Key file lines that were skipped as malformed.
    pub malformed_lines: usize,

    /// Paths of the artifacts that were written.
    pub written: Vec<PathBuf>,
}

/// Builds the accounts for every instance without writing anything.
///
/// Returns the finished [Reconciler] and a [Summary] whose [Summary::written] is empty.
pub async fn reconcile<A: Api>(ctx: &RunContext<A>) -> anyhow::Result<(Reconciler, Summary)> {
    let ids = instance::list_instances(&ctx.api)
        .await
        .context("failed to list instances")?;

    let mut reconciler = Reconciler::new();
    let mut summary = Summary {
        instances: ids.len(),
        ..Summary::default()
    };

    for id in &ids {
        info!(instance = %id, "processing key file");
        let vm = instance::instance(&ctx.api, id)
            .await
            .with_context(|| format!("failed to look up instance {id}"))?;

        let key_file =
            keyfile::path_for(&ctx.config.keydir, id).and_then(|path| keyfile::read(&path));
        let key_file = match key_file {
            Ok(key_file) => key_file,
            Err(error) => {
                warn!(instance = %id, "{:#}; skipping", anyhow::Error::from(error));
                summary.skipped.push(id.clone());
                continue;
            }
        };

        summary.malformed_lines += key_file.malformed.len();
        reconciler.accumulate(&vm.id, vm.network_port, &key_file.records);
    }

    summary.users = reconciler.len();
    summary.conflicts = reconciler.conflicts().len();
    Ok((reconciler, summary))
}

/// Runs a full reconciliation and overwrites both artifacts in [Config::outdir].
pub async fn run<A: Api>(ctx: &RunContext<A>) -> anyhow::Result<Summary> {
    let (reconciler, mut summary) = reconcile(ctx).await?;

    let authorized_keys = ctx.config.authorized_keys_path();
    info!(path = %authorized_keys.display(), "writing authorized_keys");
    fs::write(
        &authorized_keys,
        render::authorized_keys(&reconciler, &ctx.config.helper),
    )
    .with_context(|| format!("failed to write {}", authorized_keys.display()))?;
    summary.written.push(authorized_keys);

    let attributes = ctx.config.attributes_path();
    info!(path = %attributes.display(), "writing attributes");
    fs::write(&attributes, render::attributes(&reconciler))
        .with_context(|| format!("failed to write {}", attributes.display()))?;
    summary.written.push(attributes);

    Ok(summary)
}

/// Fetches the static information for one instance.
pub async fn static_info<A: Api>(ctx: &RunContext<A>, id: &str) -> anyhow::Result<JobResult> {
    instance::instance_static_info(&ctx.api, id, &ctx.backoff)
        .await
        .with_context(|| format!("failed to fetch static info for instance {id}"))
}
