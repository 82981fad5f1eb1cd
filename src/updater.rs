//! Module mirror updater.
//!
//! Plugins and shared Lua modules can be pulled from git remotes into the
//! plugins directory before anything loads. A mirror is cloned on first
//! use and fast-forwarded afterwards. Local history that diverged from the
//! remote is left alone, and an unreachable remote falls back to the copy
//! already on disk. The configured remote always wins over the mirror's
//! recorded `origin`.

use std::path::Path;

use anyhow::{Context, Result};
use git2::{build::CheckoutBuilder, Repository};

/// What an update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction {
    /// Fresh clone.
    Cloned,
    /// Moved the current branch forward.
    FastForwarded {
        /// Previous commit.
        from: String,
        /// New commit.
        to: String,
    },
    /// Already at the remote commit.
    UpToDate,
    /// Local and remote history diverged; local copy kept.
    Diverged,
    /// Remote unreachable; local copy kept.
    Offline,
}

/// Make `local_path` a current mirror of `remote`.
///
/// Returns `true` when a usable copy exists afterwards, even if it could
/// not be refreshed. Returns `false` when cloning failed or `local_path`
/// holds something that is not a repository.
pub fn ensure_up_to_date(local_path: &Path, remote: &str) -> bool {
    match update(local_path, remote) {
        Ok(action) => {
            log::info!("[Updater] {}: {:?}", local_path.display(), action);
            true
        }
        Err(e) => {
            log::error!("[Updater] Failed to update {} from {}: {e:#}", local_path.display(), remote);
            false
        }
    }
}

/// Clone or fast-forward `local_path`.
pub fn update(local_path: &Path, remote: &str) -> Result<UpdateAction> {
    if is_missing_or_empty(local_path) {
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Repository::clone(remote, local_path).with_context(|| format!("Failed to clone {remote}"))?;
        return Ok(UpdateAction::Cloned);
    }

    let repo = Repository::open(local_path)
        .with_context(|| format!("{} is not a git repository", local_path.display()))?;

    let head = repo.head().context("Repository has no HEAD")?;
    let Some(branch) = head.shorthand().filter(|_| head.is_branch()).map(str::to_string) else {
        log::warn!("[Updater] {} has a detached HEAD; leaving it as is", local_path.display());
        return Ok(UpdateAction::UpToDate);
    };
    let local_oid = head.target().context("HEAD has no target")?;
    drop(head);

    let mut origin = match repo.find_remote("origin") {
        Ok(origin) if origin.url() == Some(remote) => origin,
        Ok(origin) => {
            log::info!(
                "[Updater] {}: origin moved from {} to {}",
                local_path.display(),
                origin.url().unwrap_or("<invalid>"),
                remote
            );
            drop(origin);
            repo.remote_set_url("origin", remote)
                .context("Failed to update origin url")?;
            repo.find_remote("origin").context("origin vanished")?
        }
        Err(_) => repo.remote_anonymous(remote).context("Failed to create remote")?,
    };

    if let Err(e) = origin.fetch(&[branch.as_str()], None, None) {
        log::warn!(
            "[Updater] Fetch of {} failed, using local copy: {}",
            local_path.display(),
            e.message()
        );
        return Ok(UpdateAction::Offline);
    }

    let fetch_head = repo.find_reference("FETCH_HEAD").context("FETCH_HEAD missing after fetch")?;
    let fetched = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&fetched])?;

    if analysis.is_up_to_date() {
        return Ok(UpdateAction::UpToDate);
    }

    if !analysis.is_fast_forward() {
        log::warn!(
            "[Updater] {} diverged from {}; keeping local history",
            local_path.display(),
            remote
        );
        return Ok(UpdateAction::Diverged);
    }

    let refname = format!("refs/heads/{branch}");
    let mut reference = repo.find_reference(&refname)?;
    reference.set_target(fetched.id(), "cefhost: fast-forward")?;
    repo.set_head(&refname)?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;

    Ok(UpdateAction::FastForwarded {
        from: local_oid.to_string(),
        to: fetched.id().to_string(),
    })
}

fn is_missing_or_empty(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => !path.exists(),
    }
}
