//! Fan-out of one operation over hypervisor groups.

use std::collections::BTreeMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use hvctl_reconcile::{batches, FanOut};
use hvctl_topology::{Environment, VmSpec};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hypervisor::{ApplyMode, Hypervisor, HypervisorCache};

/// How a run dispatches work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: ApplyMode,

    /// Maximum VMs per backend call within one group.
    pub batch_size: Option<NonZeroUsize>,

    /// Maximum groups in flight.
    pub max_concurrency: Option<NonZeroUsize>,
}

impl RunOptions {
    pub fn from_settings(settings: &Settings, mode: ApplyMode) -> Self {
        Self {
            mode,
            batch_size: settings.batch_size,
            max_concurrency: settings.max_parallel,
        }
    }
}

/// Run `op` over every non-empty group, one concurrent task per hypervisor.
///
/// Within a group, VMs are sliced into batches that run sequentially in
/// input order; the first failing batch ends the group. With
/// `post_clear_caches` the hypervisor's caches are cleared once its group is
/// done, whether it failed or not. Returns the per-batch results of every
/// group, or [`Error::Aggregate`] naming each failed group once all groups
/// have finished.
pub async fn run_over<R, F, Fut>(
    cache: &HypervisorCache,
    env_name: &str,
    env: &Environment,
    groups: BTreeMap<String, Vec<VmSpec>>,
    options: &RunOptions,
    post_clear_caches: bool,
    op: F,
) -> Result<BTreeMap<String, Vec<R>>>
where
    R: Send + 'static,
    F: Fn(Arc<dyn Hypervisor>, Vec<VmSpec>, ApplyMode) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let groups: BTreeMap<String, Vec<VmSpec>> = groups
        .into_iter()
        .filter(|(_, vms)| !vms.is_empty())
        .collect();

    // Resolve every backend before any work starts.
    let mut resolved: BTreeMap<String, Arc<dyn Hypervisor>> = BTreeMap::new();
    for name in groups.keys() {
        resolved.insert(name.clone(), cache.get(env_name, env, name)?);
    }

    info!(
        environment = %env_name,
        groups = groups.len(),
        mode = %options.mode,
        batch_size = options.batch_size.map(NonZeroUsize::get),
        "Dispatching"
    );

    let resolved = Arc::new(resolved);
    let op = Arc::new(op);
    let options = *options;

    let report = FanOut::new()
        .with_max_concurrency(options.max_concurrency)
        .run(groups, move |name: String, vms: Vec<VmSpec>| {
            let resolved = Arc::clone(&resolved);
            let op = Arc::clone(&op);
            async move {
                let hypervisor = resolved
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("unresolved hypervisor {name}")))?;
                run_group(hypervisor, vms, options, post_clear_caches, op.as_ref()).await
            }
        })
        .await;

    Ok(report.into_result()?.into_iter().collect())
}

async fn run_group<R, F, Fut>(
    hypervisor: Arc<dyn Hypervisor>,
    vms: Vec<VmSpec>,
    options: RunOptions,
    post_clear_caches: bool,
    op: &F,
) -> Result<Vec<R>>
where
    F: Fn(Arc<dyn Hypervisor>, Vec<VmSpec>, ApplyMode) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let chunks = batches(vms, options.batch_size);
    let total = chunks.len();
    let mut results = Vec::with_capacity(total);
    let mut outcome = Ok(());

    for (index, chunk) in chunks.into_iter().enumerate() {
        debug!(
            hypervisor = %hypervisor.id(),
            batch = index + 1,
            batches = total,
            vms = chunk.len(),
            "Running batch"
        );
        match op(Arc::clone(&hypervisor), chunk, options.mode).await {
            Ok(result) => results.push(result),
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    if post_clear_caches {
        hypervisor.clear_caches().await;
    }

    outcome.map(|()| results)
}

#[cfg(test)]
mod tests {
    use hvctl_topology::HypervisorSpec;

    use super::*;
    use crate::hypervisor::{MockHypervisor, VmOperation};

    fn spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            node: name.to_string(),
            role: "managed_vm".to_string(),
            admin_hostname: None,
            host_ips: Default::default(),
            config: Default::default(),
        }
    }

    fn setup(names: &[&str]) -> (Environment, HypervisorCache, Vec<Arc<MockHypervisor>>) {
        let mut env = Environment::default();
        let mut mocks = BTreeMap::new();
        let mut handles = Vec::new();
        for name in names {
            env.hypervisors.insert(
                name.to_string(),
                HypervisorSpec {
                    kind: "mock".to_string(),
                    params: Default::default(),
                },
            );
            let mock = Arc::new(MockHypervisor::new(&format!("prod_{name}"), &[]));
            mocks.insert(name.to_string(), Arc::clone(&mock));
            handles.push(mock);
        }
        let cache = HypervisorCache::new(MockHypervisor::registry(mocks), Settings::default());
        (env, cache, handles)
    }

    fn apply(batch_size: Option<usize>) -> RunOptions {
        RunOptions {
            mode: ApplyMode::Apply,
            batch_size: batch_size.and_then(NonZeroUsize::new),
            max_concurrency: None,
        }
    }

    #[tokio::test]
    async fn test_batches_run_in_order() {
        let (env, cache, mocks) = setup(&["h1"]);
        let groups = BTreeMap::from([(
            "h1".to_string(),
            vec![spec("a"), spec("b"), spec("c"), spec("d"), spec("e")],
        )]);

        let results = run_over(
            &cache,
            "prod",
            &env,
            groups,
            &apply(Some(2)),
            true,
            |h, vms, mode| async move {
                VmOperation::Start.dispatch(h.as_ref(), &vms, mode).await
            },
        )
        .await
        .unwrap();

        assert_eq!(results["h1"].len(), 3);
        assert_eq!(
            mocks[0].calls_of(VmOperation::Start),
            vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]
        );
        assert_eq!(mocks[0].cache_clears(), 1);
    }

    #[tokio::test]
    async fn test_failed_group_does_not_stop_siblings() {
        let (env, cache, mocks) = setup(&["h1", "h2"]);
        mocks[0].fail_on(VmOperation::Stop);
        let groups = BTreeMap::from([
            ("h1".to_string(), vec![spec("a"), spec("b")]),
            ("h2".to_string(), vec![spec("c")]),
        ]);

        let err = run_over(
            &cache,
            "prod",
            &env,
            groups,
            &apply(Some(1)),
            true,
            |h, vms, mode| async move {
                VmOperation::Stop.dispatch(h.as_ref(), &vms, mode).await
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.failed_groups(), vec!["h1"]);
        assert_eq!(mocks[0].calls_of(VmOperation::Stop), vec![vec!["a"]]);
        assert_eq!(mocks[1].calls_of(VmOperation::Stop), vec![vec!["c"]]);
        assert_eq!(mocks[0].cache_clears(), 1);
    }

    #[tokio::test]
    async fn test_unknown_hypervisor_fails_before_dispatch() {
        let (env, cache, mocks) = setup(&["h1"]);
        let groups = BTreeMap::from([
            ("h1".to_string(), vec![spec("a")]),
            ("h9".to_string(), vec![spec("b")]),
        ]);

        let err = run_over(
            &cache,
            "prod",
            &env,
            groups,
            &apply(None),
            false,
            |h, vms, mode| async move {
                VmOperation::Start.dispatch(h.as_ref(), &vms, mode).await
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_config());
        assert!(mocks[0].calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_groups_skipped() {
        let (env, cache, mocks) = setup(&["h1"]);
        let groups = BTreeMap::from([("h1".to_string(), Vec::new())]);

        let results = run_over(
            &cache,
            "prod",
            &env,
            groups,
            &apply(None),
            true,
            |h, vms, mode| async move {
                VmOperation::Start.dispatch(h.as_ref(), &vms, mode).await
            },
        )
        .await
        .unwrap();

        assert!(results.is_empty());
        assert_eq!(mocks[0].cache_clears(), 0);
    }
}
