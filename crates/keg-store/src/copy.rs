//! Closure computation and dependency-respecting parallel copy.

use crate::interrupt::check_interrupt;
use crate::stream::{hash_nar_for_info, once_stream};
use crate::traits::Store;
use keg_core::{Error, Result, StorePath};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Options for a copy run.
#[derive(Clone, Debug, Default)]
pub struct CopyOptions {
    /// Re-ingest paths already present at the destination.
    pub repair: bool,
    /// Require a trusted signature (or self-authentication) at the
    /// destination.
    pub check_sigs: bool,
    /// Let the destination try substitution during its validity pre-check.
    pub substitute: bool,
    /// Keep copying remaining paths after a per-path failure.
    pub keep_going: bool,
    /// Bound on concurrently copying paths.
    pub max_jobs: usize,
    /// Counters updated while the run is in flight. Hand one in to poll
    /// done/running/failed from another task; left `None`, the run keeps
    /// its own and progress is visible through logs only.
    pub progress: Option<Arc<CopyProgress>>,
}

impl CopyOptions {
    fn jobs(&self) -> usize {
        self.max_jobs.max(1)
    }

    fn progress(&self) -> Arc<CopyProgress> {
        self.progress
            .as_ref()
            .map(Arc::clone)
            .unwrap_or_default()
    }
}

/// Counters observable while a copy runs. Shared with the caller through
/// [`CopyOptions::progress`]; every completion, failure, and
/// start/finish of a worker updates them.
#[derive(Debug, Default)]
pub struct CopyProgress {
    pub done: AtomicUsize,
    pub running: AtomicUsize,
    pub failed: AtomicUsize,
}

impl CopyProgress {
    fn show(&self, total: usize) {
        info!(
            done = self.done.load(Ordering::Relaxed),
            running = self.running.load(Ordering::Relaxed),
            failed = self.failed.load(Ordering::Relaxed),
            total,
            "copy progress"
        );
    }
}

/// The reflexive-transitive closure of `roots` under references.
/// Self-references do not loop.
pub async fn compute_closure(
    store: &Arc<dyn Store>,
    roots: &BTreeSet<StorePath>,
) -> Result<BTreeSet<StorePath>> {
    let mut closure = BTreeSet::new();
    let mut queue: Vec<StorePath> = roots.iter().cloned().collect();
    while let Some(path) = queue.pop() {
        check_interrupt()?;
        if !closure.insert(path.clone()) {
            continue;
        }
        let info = store.query_path_info((&path).into()).await?;
        for reference in &info.references.references {
            if !closure.contains(reference) {
                queue.push(reference.clone());
            }
        }
    }
    Ok(closure)
}

/// The destination path a source path will occupy: re-baked from the
/// content address for reference-free content-addressed paths (store
/// directories may differ), unchanged otherwise.
fn destination_path(
    dst: &Arc<dyn Store>,
    info: &keg_core::ValidPathInfo,
) -> Result<StorePath> {
    if !info.references.is_empty() {
        return Ok(info.path.clone());
    }
    match info.full_content_address()? {
        None => Ok(info.path.clone()),
        Some(ca) => {
            let baked = dst.store_dir().make_path_from_ca(info.path.name(), &ca)?;
            if baked != info.path {
                debug!(src = %info.path, dst = %baked, "re-baked content-addressed path");
            }
            Ok(baked)
        }
    }
}

/// Copy one path. The destination path is recomputed for content-addressed
/// paths; `ultimate` never survives transit; an unknown serialized size is
/// filled in by hashing on the way through (modulo the self-reference when
/// there is one).
pub async fn copy_store_path(
    src: &Arc<dyn Store>,
    dst: &Arc<dyn Store>,
    path: &StorePath,
    repair: bool,
    check_sigs: bool,
) -> Result<()> {
    check_interrupt()?;
    debug!(path = %path, src = %src.uri(), dst = %dst.uri(), "copying path");

    let mut info = (*src.query_path_info(path.into()).await?).clone();
    info.path = destination_path(dst, &info)?;
    if info.ultimate {
        info.ultimate = false;
    }

    let nar = src.nar_from_path(path).await?;
    if info.nar_size == 0 {
        // the source did not know the size; hash in transit
        let data = crate::stream::collect(nar).await?;
        let (nar_hash, nar_size) = hash_nar_for_info(&info, &data);
        info.nar_hash = nar_hash;
        info.nar_size = nar_size;
        dst.add_to_store(&info, once_stream(data), repair, check_sigs)
            .await
    } else {
        // a single pipe end to end; chunks arrive in source order
        dst.add_to_store(&info, nar, repair, check_sigs).await
    }
}

struct CopyPlan {
    /// Destination path per missing source path.
    targets: BTreeMap<StorePath, StorePath>,
    /// Unfinished in-set dependencies per path.
    deps_left: HashMap<StorePath, usize>,
    /// Reverse edges: who waits on this path.
    dependents: HashMap<StorePath, Vec<StorePath>>,
}

/// Copy `roots` from `src` to `dst`, dependencies before dependents.
///
/// Returns the source-to-destination path mapping (identity except for
/// re-baked content-addressed paths). A path failure aborts the run after
/// in-flight copies finish unless `keep_going` is set, in which case the
/// failed path's dependents are abandoned and the run still returns the
/// full mapping — abandoned entries map to the destination path they
/// would have occupied, whether or not anything was copied there.
/// `InvalidPath` results from the destination pre-check are what mark
/// paths missing, so they never surface from here.
pub async fn copy_paths(
    src: &Arc<dyn Store>,
    dst: &Arc<dyn Store>,
    roots: &BTreeSet<StorePath>,
    options: &CopyOptions,
) -> Result<BTreeMap<StorePath, StorePath>> {
    let valid = dst.query_valid_paths(roots, options.substitute).await?;
    let missing: BTreeSet<StorePath> = roots.difference(&valid).cloned().collect();

    let mut paths_map: BTreeMap<StorePath, StorePath> =
        roots.iter().map(|p| (p.clone(), p.clone())).collect();
    if missing.is_empty() {
        return Ok(paths_map);
    }
    info!(count = missing.len(), src = %src.uri(), dst = %dst.uri(), "copying paths");

    // plan: destination paths and the dependency graph over the missing set
    let mut plan = CopyPlan {
        targets: BTreeMap::new(),
        deps_left: HashMap::new(),
        dependents: HashMap::new(),
    };
    for path in &missing {
        check_interrupt()?;
        let info = src.query_path_info(path.into()).await?;
        plan.targets
            .insert(path.clone(), destination_path(dst, &info)?);

        let deps: Vec<StorePath> = info
            .references
            .references
            .iter()
            .filter(|r| *r != path && missing.contains(*r))
            .cloned()
            .collect();
        plan.deps_left.insert(path.clone(), deps.len());
        for dep in deps {
            plan.dependents
                .entry(dep)
                .or_default()
                .push(path.clone());
        }
    }
    for (source, target) in &plan.targets {
        paths_map.insert(source.clone(), target.clone());
    }

    let total = missing.len();
    let progress = options.progress();
    let semaphore = Arc::new(Semaphore::new(options.jobs()));
    let deps_left = Arc::new(Mutex::new(plan.deps_left));
    let dependents = Arc::new(plan.dependents);
    let targets = Arc::new(plan.targets);

    let spawn_one = |join_set: &mut JoinSet<(StorePath, Result<()>)>, path: StorePath| {
        let src = Arc::clone(src);
        let dst = Arc::clone(dst);
        let semaphore = Arc::clone(&semaphore);
        let progress = Arc::clone(&progress);
        let targets = Arc::clone(&targets);
        let repair = options.repair;
        let check_sigs = options.check_sigs;
        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (path, Err(Error::Other("copy pool closed".into()))),
            };
            progress.running.fetch_add(1, Ordering::Relaxed);
            let result = async {
                check_interrupt()?;
                let target = targets.get(&path).expect("planned path");
                if dst.is_valid_path(target.into()).await? {
                    return Ok(());
                }
                copy_store_path(&src, &dst, &path, repair, check_sigs).await
            }
            .await;
            progress.running.fetch_sub(1, Ordering::Relaxed);
            (path, result)
        });
    };

    let mut join_set: JoinSet<(StorePath, Result<()>)> = JoinSet::new();
    for path in &missing {
        if deps_left.lock().expect("copy graph poisoned")[path] == 0 {
            spawn_one(&mut join_set, path.clone());
        }
    }

    let mut stashed: Option<Error> = None;
    let mut aborting = false;
    while let Some(joined) = join_set.join_next().await {
        let (path, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                if stashed.is_none() {
                    stashed = Some(Error::Other(format!("copy worker panicked: {e}")));
                }
                aborting = true;
                continue;
            }
        };
        match result {
            Ok(()) => {
                progress.done.fetch_add(1, Ordering::Relaxed);
                progress.show(total);
                if aborting {
                    continue;
                }
                if let Some(waiting) = dependents.get(&path) {
                    let mut left = deps_left.lock().expect("copy graph poisoned");
                    for dependent in waiting {
                        let remaining = left
                            .get_mut(dependent)
                            .expect("dependent in graph");
                        *remaining -= 1;
                        if *remaining == 0 {
                            spawn_one(&mut join_set, dependent.clone());
                        }
                    }
                }
            }
            Err(e) => {
                progress.failed.fetch_add(1, Ordering::Relaxed);
                progress.show(total);
                warn!(path = %path, error = %e, "could not copy path");
                if options.keep_going {
                    // dependents of a failed path cannot proceed; their
                    // branches are abandoned
                    continue;
                }
                if stashed.is_none() {
                    stashed = Some(e);
                }
                aborting = true;
            }
        }
    }

    match stashed {
        Some(e) => Err(e),
        None => Ok(paths_map),
    }
}

/// Copy the full closure of `roots`.
pub async fn copy_closure(
    src: &Arc<dyn Store>,
    dst: &Arc<dyn Store>,
    roots: &BTreeSet<StorePath>,
    options: &CopyOptions,
) -> Result<BTreeMap<StorePath, StorePath>> {
    let closure = compute_closure(src, roots).await?;
    copy_paths(src, dst, &closure, options).await
}

/// Fetch one path from the first substituter that can produce it intact.
///
/// Substituters are assumed already ordered by priority. A hash mismatch or
/// absence moves on to the next; any other error aborts.
pub async fn substitute_path(
    dst: &Arc<dyn Store>,
    path: &StorePath,
    substituters: &[Arc<dyn Store>],
    check_sigs: bool,
) -> Result<()> {
    if dst.is_valid_path(path.into()).await? {
        return Ok(());
    }
    let mut last: Option<Error> = None;
    for substituter in substituters {
        check_interrupt()?;
        match copy_store_path(substituter, dst, path, false, check_sigs).await {
            Ok(()) => return Ok(()),
            Err(e @ (Error::HashMismatch { .. } | Error::InvalidPath(_))) => {
                warn!(
                    path = %path,
                    substituter = %substituter.uri(),
                    error = %e,
                    "substituter failed, trying next"
                );
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::InvalidPath(dst.store_dir().print_path(path))))
}
