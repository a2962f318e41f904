//! Blocking git2 operations on the working tree.
//!
//! `git2::Repository` is not `Sync`, so every function here opens the
//! repository itself and is meant to run on the blocking pool.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use filing_core::FilingError;
use git2::build::{CheckoutBuilder, RepoBuilder, TreeUpdateBuilder};
use git2::{
    BranchType, Commit, Cred, ErrorCode, FetchOptions, FileMode, Oid, PushOptions,
    RemoteCallbacks, Repository, ResetType, Signature, StatusOptions,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::provider::GitOptions;

/// How `fetch` brought the local branch up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchAction {
    UpToDate,
    /// The remote has no such branch yet.
    NoRemoteBranch,
    FastForwarded,
    Merged,
    /// Local history was discarded in favor of the remote tip.
    ResetToRemote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    /// Commits on the local branch that the remote lacks, before integration
    pub ahead: usize,
    /// Commits on the remote branch that the local one lacks, before integration
    pub behind: usize,
    pub action: FetchAction,
    /// Short id of HEAD afterwards
    pub head: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    NothingToPush,
    /// The remote refused a non-fast-forward update.
    Rejected(String),
}

/// Working-tree status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GitStatus {
    pub branch: String,
    pub head: Option<String>,
    pub ahead: usize,
    pub behind: usize,
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
}

fn git_err(context: &str, e: git2::Error) -> FilingError {
    FilingError::Git(format!("{}: {}", context, e))
}

fn short_id(oid: Oid) -> String {
    let full = oid.to_string();
    full[..full.len().min(12)].to_string()
}

fn local_ref(options: &GitOptions) -> String {
    format!("refs/heads/{}", options.branch)
}

fn remote_ref(options: &GitOptions) -> String {
    format!("refs/remotes/origin/{}", options.branch)
}

/// Insert `username:token@` into an http(s) URL. Other URLs pass through.
pub fn authenticated_url(url: &str, username: Option<&str>, token: Option<&str>) -> String {
    let Some(token) = token else {
        return url.to_string();
    };
    for scheme in ["https://", "http://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            // Already carries credentials
            if rest.split('/').next().is_some_and(|host| host.contains('@')) {
                return url.to_string();
            }
            let user = username.unwrap_or("x-access-token");
            return format!("{}{}:{}@{}", scheme, user, token, rest);
        }
    }
    url.to_string()
}

/// Credentials plus transfer callbacks that abort once `cancel` is set.
fn remote_callbacks<'a>(options: &GitOptions, cancel: &'a AtomicBool) -> RemoteCallbacks<'a> {
    let username = options.username.clone();
    let token = options.token.clone();
    let cfg = git2::Config::open_default().ok();

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.is_user_pass_plaintext() {
            if let Some(token) = token.as_deref() {
                let user = username
                    .as_deref()
                    .or(username_from_url)
                    .unwrap_or("x-access-token");
                return Cred::userpass_plaintext(user, token);
            }
            if let Some(cfg) = cfg.as_ref() {
                if let Ok(cred) = Cred::credential_helper(cfg, url, username_from_url) {
                    return Ok(cred);
                }
            }
        }
        if allowed.is_ssh_key() {
            if let Some(user) = username_from_url.or(username.as_deref()) {
                return Cred::ssh_key_from_agent(user);
            }
        }
        Cred::default()
    });
    callbacks.transfer_progress(move |_| !cancel.load(Ordering::SeqCst));
    callbacks.sideband_progress(move |_| !cancel.load(Ordering::SeqCst));
    callbacks.push_negotiation(move |_| {
        if cancel.load(Ordering::SeqCst) {
            Err(git2::Error::from_str("push cancelled"))
        } else {
            Ok(())
        }
    });
    callbacks
}

fn fetch_options<'a>(options: &GitOptions, cancel: &'a AtomicBool) -> FetchOptions<'a> {
    let mut fo = FetchOptions::new();
    fo.remote_callbacks(remote_callbacks(options, cancel));
    fo
}

/// Sibling directory a clone is written to before it is moved into place.
fn staging_path(workdir: &Path) -> PathBuf {
    let name = workdir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "work".to_string());
    workdir.with_file_name(format!(".{}.cloning", name))
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> FilingError {
    FilingError::Io(format!("{} {}: {}", context, path.display(), e))
}

/// Clone into a staging directory and move it to `workdir` only once
/// complete, so an interrupted clone never looks like a usable repository.
fn clone_into(
    options: &GitOptions,
    workdir: &Path,
    cancel: &AtomicBool,
) -> Result<Repository, FilingError> {
    let url = authenticated_url(
        &options.remote_url,
        options.username.as_deref(),
        options.token.as_deref(),
    );
    let staging = staging_path(workdir);
    if staging.exists() {
        warn!("Removing leftover partial clone at {}", staging.display());
        std::fs::remove_dir_all(&staging).map_err(|e| io_err("remove", &staging, e))?;
    }

    info!("Cloning {} into {}", options.remote_url, workdir.display());
    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options(options, cancel));
    let cloned = builder.clone(&url, &staging).and_then(|repo| {
        // Keep credentials out of .git/config; the callbacks supply them.
        if url != options.remote_url {
            repo.remote_set_url("origin", &options.remote_url)?;
        }
        Ok(())
    });
    if let Err(e) = cloned {
        if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial clone {}: {}", staging.display(), cleanup);
            }
        }
        return Err(git_err(&format!("clone {}", options.remote_url), e));
    }

    if workdir.exists() {
        // Only an empty directory may be replaced
        std::fs::remove_dir(workdir).map_err(|e| io_err("replace", workdir, e))?;
    }
    if let Some(parent) = workdir.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err("create", parent, e))?;
    }
    std::fs::rename(&staging, workdir).map_err(|e| io_err("move clone to", workdir, e))?;
    open(workdir)
}

pub fn open(workdir: &Path) -> Result<Repository, FilingError> {
    Repository::open(workdir)
        .map_err(|e| git_err(&format!("open repository at {}", workdir.display()), e))
}

fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>, FilingError> {
    match repo.head() {
        Ok(head) => head
            .peel_to_commit()
            .map(Some)
            .map_err(|e| git_err("resolve HEAD commit", e)),
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
            Ok(None)
        }
        Err(e) => Err(git_err("resolve HEAD", e)),
    }
}

// =============================================================================
// Setup
// =============================================================================

/// Clone if needed, set the author identity and check out the branch.
pub fn prepare(options: &GitOptions, workdir: &Path, cancel: &AtomicBool) -> Result<(), FilingError> {
    let repo = if workdir.join(".git").exists() {
        debug!("Opening existing clone at {}", workdir.display());
        open(workdir)?
    } else {
        clone_into(options, workdir, cancel)?
    };

    let mut config = repo.config().map_err(|e| git_err("open config", e))?;
    config
        .set_str("user.name", &options.author_name)
        .map_err(|e| git_err("set user.name", e))?;
    config
        .set_str("user.email", &options.author_email)
        .map_err(|e| git_err("set user.email", e))?;

    checkout_branch(&repo, options)
}

fn checkout_branch(repo: &Repository, options: &GitOptions) -> Result<(), FilingError> {
    let branch = &options.branch;
    let local = local_ref(options);

    if repo.find_branch(branch, BranchType::Local).is_ok() {
        let on_branch = repo
            .head()
            .ok()
            .and_then(|h| h.name().map(|n| n == local))
            .unwrap_or(false);
        if !on_branch {
            repo.set_head(&local)
                .map_err(|e| git_err(&format!("switch to {}", branch), e))?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))
                .map_err(|e| git_err(&format!("check out {}", branch), e))?;
        }
        debug!("On existing branch {}", branch);
        return Ok(());
    }

    if let Ok(reference) = repo.find_reference(&remote_ref(options)) {
        let commit = reference
            .peel_to_commit()
            .map_err(|e| git_err("resolve remote branch", e))?;
        let mut created = repo
            .branch(branch, &commit, false)
            .map_err(|e| git_err(&format!("create branch {}", branch), e))?;
        let upstream = format!("origin/{}", branch);
        created
            .set_upstream(Some(upstream.as_str()))
            .map_err(|e| git_err("set upstream", e))?;
        repo.set_head(&local)
            .map_err(|e| git_err(&format!("switch to {}", branch), e))?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))
            .map_err(|e| git_err(&format!("check out {}", branch), e))?;
        info!("Created {} tracking origin/{}", branch, branch);
        return Ok(());
    }

    // Neither local nor remote: start an unborn branch
    repo.set_head(&local)
        .map_err(|e| git_err(&format!("point HEAD at {}", branch), e))?;
    info!("Branch {} does not exist yet; HEAD is unborn", branch);
    Ok(())
}

// =============================================================================
// Index
// =============================================================================

/// Stage `key` (or its removal) in the index.
pub fn stage(workdir: &Path, key: &str, removed: bool) -> Result<(), FilingError> {
    let repo = open(workdir)?;
    let mut index = repo.index().map_err(|e| git_err("open index", e))?;
    let path = Path::new(key);
    if removed {
        index
            .remove_path(path)
            .map_err(|e| git_err(&format!("unstage {}", key), e))?;
    } else {
        index
            .add_path(path)
            .map_err(|e| git_err(&format!("stage {}", key), e))?;
    }
    index.write().map_err(|e| git_err("write index", e))?;
    Ok(())
}

// =============================================================================
// Commit
// =============================================================================

/// Commit exactly `files` (as they are in the working tree) on top of HEAD.
///
/// Files missing from the working tree are removed from the commit tree.
/// Returns `None` without committing when the tree would equal HEAD's.
pub fn commit_files(
    options: &GitOptions,
    workdir: &Path,
    files: &[String],
    message: &str,
) -> Result<Option<String>, FilingError> {
    let repo = open(workdir)?;
    let signature = Signature::now(&options.author_name, &options.author_email)
        .map_err(|e| git_err("build signature", e))?;

    let parent = head_commit(&repo)?;
    let base_tree = match &parent {
        Some(commit) => commit.tree().map_err(|e| git_err("read HEAD tree", e))?,
        None => {
            let empty = repo
                .treebuilder(None)
                .and_then(|b| b.write())
                .map_err(|e| git_err("build empty tree", e))?;
            repo.find_tree(empty)
                .map_err(|e| git_err("find empty tree", e))?
        }
    };

    let mut update = TreeUpdateBuilder::new();
    for file in files {
        let on_disk = workdir.join(file);
        if on_disk.is_file() {
            let blob = repo
                .blob_path(&on_disk)
                .map_err(|e| git_err(&format!("hash {}", file), e))?;
            update.upsert(file.as_str(), blob, FileMode::Blob);
        } else if base_tree.get_path(Path::new(file)).is_ok() {
            update.remove(file.as_str());
        }
    }
    let tree_oid = update
        .create_updated(&repo, &base_tree)
        .map_err(|e| git_err("build commit tree", e))?;
    let tree = repo
        .find_tree(tree_oid)
        .map_err(|e| git_err("find commit tree", e))?;

    let unchanged = match &parent {
        Some(commit) => commit.tree_id() == tree_oid,
        None => tree.is_empty(),
    };
    if unchanged {
        info!("Nothing to commit for {} files", files.len());
        return Ok(None);
    }

    let parents: Vec<&Commit<'_>> = parent.iter().collect();
    let oid = repo
        .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .map_err(|e| git_err("commit", e))?;

    info!("Committed {} ({} files)", short_id(oid), files.len());
    Ok(Some(oid.to_string()))
}

// =============================================================================
// Fetch / Push
// =============================================================================

/// Fetch origin and integrate the remote branch.
///
/// Fast-forwards when only behind and merges when diverged. A merge conflict,
/// or working-tree changes the update would overwrite, resolves as "latest
/// wins": hard reset to the remote tip.
pub fn fetch(
    options: &GitOptions,
    workdir: &Path,
    cancel: &AtomicBool,
) -> Result<FetchReport, FilingError> {
    let repo = open(workdir)?;
    {
        let mut remote = repo
            .find_remote("origin")
            .map_err(|e| git_err("find origin", e))?;
        let mut fo = fetch_options(options, cancel);
        remote
            .fetch(&[] as &[&str], Some(&mut fo), None)
            .map_err(|e| git_err("fetch origin", e))?;
    }

    let Ok(remote_oid) = repo.refname_to_id(&remote_ref(options)) else {
        debug!("origin/{} does not exist yet", options.branch);
        return Ok(FetchReport {
            ahead: 0,
            behind: 0,
            action: FetchAction::NoRemoteBranch,
            head: head_commit(&repo)?.map(|c| short_id(c.id())),
        });
    };

    let local = local_ref(options);
    let Ok(local_oid) = repo.refname_to_id(&local) else {
        // Unborn local branch: adopt the remote tip
        let behind = repo
            .revwalk()
            .and_then(|mut walk| walk.push(remote_oid).map(|_| walk.count()))
            .map_err(|e| git_err("count remote commits", e))?;
        repo.reference(&local, remote_oid, true, "filing: adopt remote branch")
            .map_err(|e| git_err("create local branch", e))?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))
            .map_err(|e| git_err("check out remote tip", e))?;
        return Ok(FetchReport {
            ahead: 0,
            behind,
            action: FetchAction::FastForwarded,
            head: Some(short_id(remote_oid)),
        });
    };

    let (ahead, behind) = repo
        .graph_ahead_behind(local_oid, remote_oid)
        .map_err(|e| git_err("compare with origin", e))?;
    debug!("{} is {} ahead, {} behind origin", options.branch, ahead, behind);

    if cancel.load(Ordering::SeqCst) {
        return Err(FilingError::Timeout("fetch cancelled before integration".to_string()));
    }
    let action = if behind == 0 {
        FetchAction::UpToDate
    } else if ahead == 0 {
        fast_forward(&repo, &local, remote_oid)?
    } else {
        merge(&repo, options, local_oid, remote_oid)?
    };

    let head = head_commit(&repo)?.map(|c| short_id(c.id()));
    Ok(FetchReport {
        ahead,
        behind,
        action,
        head,
    })
}

fn fast_forward(repo: &Repository, local: &str, remote_oid: Oid) -> Result<FetchAction, FilingError> {
    let target = repo
        .find_commit(remote_oid)
        .and_then(|c| c.tree())
        .map_err(|e| git_err("read remote tree", e))?;

    if let Err(e) = repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe())) {
        warn!("Fast-forward blocked by local changes: {}", e);
        return reset_to(repo, remote_oid);
    }

    repo.find_reference(local)
        .and_then(|mut r| r.set_target(remote_oid, "filing: fast-forward"))
        .map_err(|e| git_err("advance branch", e))?;
    Ok(FetchAction::FastForwarded)
}

fn merge(
    repo: &Repository,
    options: &GitOptions,
    local_oid: Oid,
    remote_oid: Oid,
) -> Result<FetchAction, FilingError> {
    let local_commit = repo
        .find_commit(local_oid)
        .map_err(|e| git_err("find local commit", e))?;
    let remote_commit = repo
        .find_commit(remote_oid)
        .map_err(|e| git_err("find remote commit", e))?;

    let mut index = repo
        .merge_commits(&local_commit, &remote_commit, None)
        .map_err(|e| git_err("merge", e))?;
    if index.has_conflicts() {
        warn!("Merge with origin/{} conflicts", options.branch);
        return reset_to(repo, remote_oid);
    }

    let tree_oid = index
        .write_tree_to(repo)
        .map_err(|e| git_err("write merge tree", e))?;
    let tree = repo
        .find_tree(tree_oid)
        .map_err(|e| git_err("find merge tree", e))?;

    if let Err(e) = repo.checkout_tree(tree.as_object(), Some(CheckoutBuilder::new().safe())) {
        warn!("Merge blocked by local changes: {}", e);
        return reset_to(repo, remote_oid);
    }

    let signature = Signature::now(&options.author_name, &options.author_email)
        .map_err(|e| git_err("build signature", e))?;
    let message = format!("Merge origin/{0} into {0}", options.branch);
    repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        &message,
        &tree,
        &[&local_commit, &remote_commit],
    )
    .map_err(|e| git_err("commit merge", e))?;
    Ok(FetchAction::Merged)
}

fn reset_to(repo: &Repository, remote_oid: Oid) -> Result<FetchAction, FilingError> {
    let target = repo
        .find_object(remote_oid, None)
        .map_err(|e| git_err("find remote tip", e))?;
    repo.reset(&target, ResetType::Hard, Some(CheckoutBuilder::new().force()))
        .map_err(|e| git_err("hard reset", e))?;
    warn!("Reset to remote tip {} (latest wins)", short_id(remote_oid));
    Ok(FetchAction::ResetToRemote)
}

fn is_non_fast_forward(message: &str) -> bool {
    message.contains("non-fast-forward")
        || message.contains("fetch first")
        || message.contains("cannot lock ref")
        || message.contains("failed to update ref")
}

/// Push the branch to origin.
pub fn push(
    options: &GitOptions,
    workdir: &Path,
    cancel: &AtomicBool,
) -> Result<PushOutcome, FilingError> {
    let repo = open(workdir)?;
    let local = local_ref(options);
    if repo.refname_to_id(&local).is_err() {
        return Ok(PushOutcome::NothingToPush);
    }

    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| git_err("find origin", e))?;
    let refspec = format!("{0}:{0}", local);
    let rejection: RefCell<Option<String>> = RefCell::new(None);

    {
        let mut callbacks = remote_callbacks(options, cancel);
        callbacks.push_update_reference(|_ref_name, status| {
            if let Some(msg) = status {
                *rejection.borrow_mut() = Some(msg.to_string());
            }
            Ok(())
        });
        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(callbacks);

        if let Err(e) = remote.push(&[refspec.as_str()], Some(&mut push_options)) {
            let msg = e.to_string();
            if e.code() == ErrorCode::NotFastForward || is_non_fast_forward(&msg) {
                return Ok(PushOutcome::Rejected(msg));
            }
            return Err(git_err("push", e));
        }
    }

    if let Some(msg) = rejection.into_inner() {
        if is_non_fast_forward(&msg) {
            return Ok(PushOutcome::Rejected(msg));
        }
        return Err(FilingError::Git(format!("push rejected: {}", msg)));
    }
    Ok(PushOutcome::Pushed)
}

// =============================================================================
// Status
// =============================================================================

pub fn status(options: &GitOptions, workdir: &Path) -> Result<GitStatus, FilingError> {
    let repo = open(workdir)?;
    let mut status = GitStatus {
        branch: options.branch.clone(),
        head: head_commit(&repo)?.map(|c| short_id(c.id())),
        ..GitStatus::default()
    };

    if let (Ok(local), Ok(remote)) = (
        repo.refname_to_id(&local_ref(options)),
        repo.refname_to_id(&remote_ref(options)),
    ) {
        let (ahead, behind) = repo
            .graph_ahead_behind(local, remote)
            .map_err(|e| git_err("compare with origin", e))?;
        status.ahead = ahead;
        status.behind = behind;
    }

    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo
        .statuses(Some(&mut opts))
        .map_err(|e| git_err("read status", e))?;

    for entry in statuses.iter() {
        let Some(path) = entry.path() else { continue };
        let flags = entry.status();
        if flags.is_index_new()
            || flags.is_index_modified()
            || flags.is_index_deleted()
            || flags.is_index_renamed()
        {
            status.staged.push(path.to_string());
        }
        if flags.is_wt_modified() || flags.is_wt_deleted() {
            status.modified.push(path.to_string());
        }
        if flags.is_wt_new() {
            status.untracked.push(path.to_string());
        }
    }
    Ok(status)
}
