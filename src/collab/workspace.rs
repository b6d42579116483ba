//! Isolated agent workspaces and the shared delivery line.
//!
//! Each agent works in its own git worktree on `weave/agent/<id>`, branched
//! from the delivery line. The delivery branch is checked out in a worktree
//! of its own so that validation and single-agent work never touch the
//! user's checkout. The commit an agent started from is kept under
//! `refs/weave/base/<id>`; it is the base for change statistics and for
//! applying the agent's work onto the delivery line as one squashed commit.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, ErrorCode, Index, IndexAddOption, Oid, Repository, ResetType, Signature,
    WorktreeAddOptions, WorktreePruneOptions,
};
use tracing::{debug, info, warn};

use crate::agent::AgentId;
use crate::collab::stats::AgentPrStats;
use crate::config::Config;
use crate::util::blocking;
use crate::Result;

const DELIVERY_WORKTREE: &str = "delivery";
const AGENT_WORKTREE_PREFIX: &str = "agent-";
const AGENT_BRANCH_PREFIX: &str = "weave/agent/";
const BASE_REF_PREFIX: &str = "refs/weave/base/";

/// Result of applying an agent's change onto the delivery line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPick {
    Applied { commit: String },
    /// The change is empty or already present on the delivery line.
    Empty,
    /// Delivery line left untouched.
    Conflict { files: Vec<String> },
}

/// Version-control operations used by the collaborative executor.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Make sure the delivery line and its worktree exist.
    async fn init_repo(&self) -> Result<()>;

    /// Worktree for `agent` at the current delivery head. An existing one is
    /// re-synced.
    async fn create_worktree(&self, agent: &AgentId) -> Result<PathBuf>;

    /// Commit everything in the agent's worktree. None if nothing changed.
    async fn commit(&self, agent: &AgentId, message: &str) -> Result<Option<String>>;

    /// Size of the agent's change since its base.
    async fn stats(&self, agent: &AgentId) -> Result<AgentPrStats>;

    /// Apply the agent's change since its base onto the delivery line.
    async fn cherry_pick(&self, agent: &AgentId) -> Result<CherryPick>;

    async fn delivery_head(&self) -> Result<String>;

    async fn reset_delivery_to(&self, commit: &str) -> Result<()>;

    /// Discard the agent's work and move its worktree (and base) to the
    /// delivery head.
    async fn sync_worktree_to_delivery(&self, agent: &AgentId) -> Result<()>;

    fn delivery_path(&self) -> PathBuf;

    /// Commit everything in the delivery worktree. None if nothing changed.
    async fn commit_delivery(&self, message: &str) -> Result<Option<String>>;

    async fn remove_worktree(&self, agent: &AgentId) -> Result<()>;
}

/// [`Workspace`] backed by git worktrees.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
    delivery_branch: String,
}

impl GitWorkspace {
    pub fn new(repo_path: &Path, worktrees_dir: &Path, delivery_branch: &str) -> Result<Self> {
        debug!(repo = %repo_path.display(), worktrees = %worktrees_dir.display(), "GitWorkspace::new");
        let repo = Repository::discover(repo_path)?;
        let repo_path = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.path().to_path_buf());
        Ok(Self {
            repo_path,
            worktrees_dir: worktrees_dir.to_path_buf(),
            delivery_branch: delivery_branch.to_string(),
        })
    }

    pub fn from_config(repo_path: &Path, config: &Config) -> Result<Self> {
        Self::new(
            repo_path,
            &config.worktrees_dir(repo_path),
            &config.collaboration.delivery_branch,
        )
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn delivery_branch(&self) -> &str {
        &self.delivery_branch
    }

    pub fn agent_path(&self, agent: &AgentId) -> PathBuf {
        self.worktrees_dir.join("agents").join(agent.as_str())
    }

    pub fn agent_branch(agent: &AgentId) -> String {
        format!("{}{}", AGENT_BRANCH_PREFIX, agent)
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn delivery_ref(&self) -> String {
        format!("refs/heads/{}", self.delivery_branch)
    }

    fn delivery_commit<'r>(&self, repo: &'r Repository) -> Result<Commit<'r>> {
        Ok(repo.find_reference(&self.delivery_ref())?.peel_to_commit()?)
    }

    fn init_repo_sync(&self) -> Result<()> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head.peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::UnbornBranch => initial_commit(&repo)?,
            Err(e) => return Err(e.into()),
        };
        self.exclude_worktrees_dir(&repo)?;

        match repo.find_branch(&self.delivery_branch, BranchType::Local) {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::NotFound => {
                info!(branch = %self.delivery_branch, from = %head.id(), "Creating delivery branch");
                repo.branch(&self.delivery_branch, &head, false)?;
            }
            Err(e) => return Err(e.into()),
        }

        let path = self.delivery_path();
        if is_worktree(&path) {
            return Ok(());
        }
        remove_linked_worktree(&repo, DELIVERY_WORKTREE, &path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let reference = repo.find_reference(&self.delivery_ref())?;
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(DELIVERY_WORKTREE, &path, Some(&opts))?;
        debug!(path = %path.display(), "Delivery worktree created");
        Ok(())
    }

    /// Keep the worktree directory out of `git status` when it lives inside
    /// the repository.
    fn exclude_worktrees_dir(&self, repo: &Repository) -> Result<()> {
        let Some(workdir) = repo.workdir() else {
            return Ok(());
        };
        let Ok(relative) = self.worktrees_dir.strip_prefix(workdir) else {
            return Ok(());
        };
        let Some(top) = relative.components().next() else {
            return Ok(());
        };
        let pattern = format!("/{}/", top.as_os_str().to_string_lossy());

        let exclude = repo.path().join("info").join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        if let Some(parent) = exclude.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{}", pattern)?;
        Ok(())
    }

    fn create_worktree_sync(&self, agent: &AgentId) -> Result<PathBuf> {
        let path = self.agent_path(agent);
        if is_worktree(&path) {
            debug!(%agent, "Reusing agent worktree");
            self.sync_worktree_sync(agent)?;
            return Ok(path);
        }

        let repo = self.repo()?;
        let delivery = self.delivery_commit(&repo)?;
        let name = format!("{}{}", AGENT_WORKTREE_PREFIX, agent);
        remove_linked_worktree(&repo, &name, &path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let branch = repo.branch(&Self::agent_branch(agent), &delivery, true)?;
        let reference = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(&name, &path, Some(&opts))?;
        repo.reference(&base_ref(agent), delivery.id(), true, "weave: worktree base")?;

        info!(%agent, path = %path.display(), base = %delivery.id(), "Agent worktree created");
        Ok(path)
    }

    fn stats_sync(&self, agent: &AgentId) -> Result<AgentPrStats> {
        let repo = self.repo()?;
        let base = repo.find_reference(&base_ref(agent))?.peel_to_tree()?;
        let head = repo
            .find_branch(&Self::agent_branch(agent), BranchType::Local)?
            .get()
            .peel_to_tree()?;
        let stats = repo
            .diff_tree_to_tree(Some(&base), Some(&head), None)?
            .stats()?;
        Ok(AgentPrStats::new(
            agent.clone(),
            stats.insertions(),
            stats.deletions(),
            stats.files_changed(),
        ))
    }

    fn cherry_pick_sync(&self, agent: &AgentId) -> Result<CherryPick> {
        let repo = Repository::open(self.delivery_path())?;
        let base = repo.find_reference(&base_ref(agent))?.peel_to_commit()?;
        let theirs = repo
            .find_reference(&format!("refs/heads/{}", Self::agent_branch(agent)))?
            .peel_to_commit()?;
        let ours = repo.head()?.peel_to_commit()?;

        if theirs.tree_id() == base.tree_id() {
            return Ok(CherryPick::Empty);
        }

        let mut index = repo.merge_trees(&base.tree()?, &ours.tree()?, &theirs.tree()?, None)?;
        if index.has_conflicts() {
            let files = conflict_paths(&index)?;
            debug!(%agent, ?files, "Cherry-pick conflicts");
            return Ok(CherryPick::Conflict { files });
        }

        let tree_id = index.write_tree_to(&repo)?;
        if tree_id == ours.tree_id() {
            return Ok(CherryPick::Empty);
        }

        let tree = repo.find_tree(tree_id)?;
        let committer = signature(&repo)?;
        let message = theirs.message().unwrap_or("weave: integrate agent change");
        let commit = repo.commit(
            Some("HEAD"),
            &theirs.author(),
            &committer,
            message,
            &tree,
            &[&ours],
        )?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;

        info!(%agent, %commit, "Change applied to delivery line");
        Ok(CherryPick::Applied {
            commit: commit.to_string(),
        })
    }

    fn reset_delivery_sync(&self, commit: &str) -> Result<()> {
        let repo = Repository::open(self.delivery_path())?;
        let target = repo.find_commit(Oid::from_str(commit)?)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(target.as_object(), ResetType::Hard, Some(&mut checkout))?;
        info!(%commit, "Delivery line reset");
        Ok(())
    }

    fn sync_worktree_sync(&self, agent: &AgentId) -> Result<()> {
        let repo = Repository::open(self.agent_path(agent))?;
        let delivery = self.delivery_commit(&repo)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.reset(delivery.as_object(), ResetType::Hard, Some(&mut checkout))?;
        repo.reference(&base_ref(agent), delivery.id(), true, "weave: sync to delivery")?;
        debug!(%agent, base = %delivery.id(), "Agent worktree synced to delivery");
        Ok(())
    }

    fn remove_worktree_sync(&self, agent: &AgentId) -> Result<()> {
        debug!(%agent, "GitWorkspace::remove_worktree");
        let repo = self.repo()?;
        let name = format!("{}{}", AGENT_WORKTREE_PREFIX, agent);
        remove_linked_worktree(&repo, &name, &self.agent_path(agent))?;

        if let Ok(mut reference) = repo.find_reference(&base_ref(agent)) {
            if let Err(e) = reference.delete() {
                warn!(%agent, error = %e, "Failed to delete base ref");
            }
        }
        delete_branch(&repo, &Self::agent_branch(agent));
        Ok(())
    }

    /// Remove every weave worktree, agent branch and base ref. The delivery
    /// branch itself is kept. Returns the number of worktrees removed.
    pub fn cleanup(&self) -> Result<usize> {
        debug!("GitWorkspace::cleanup");
        let repo = self.repo()?;

        let mut removed = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if name != DELIVERY_WORKTREE && !name.starts_with(AGENT_WORKTREE_PREFIX) {
                continue;
            }
            let path = repo.find_worktree(name)?.path().to_path_buf();
            remove_linked_worktree(&repo, name, &path)?;
            removed += 1;
        }

        let base_refs: Vec<String> = repo
            .references_glob(&format!("{}*", BASE_REF_PREFIX))?
            .flatten()
            .filter_map(|reference| reference.name().map(String::from))
            .collect();
        for name in base_refs {
            if let Ok(mut reference) = repo.find_reference(&name) {
                let _ = reference.delete();
            }
        }

        let agent_branches: Vec<String> = repo
            .branches(Some(BranchType::Local))?
            .flatten()
            .filter_map(|(branch, _)| branch.name().ok().flatten().map(String::from))
            .filter(|name| name.starts_with(AGENT_BRANCH_PREFIX))
            .collect();
        for name in agent_branches {
            delete_branch(&repo, &name);
        }

        info!(removed, "Weave worktrees cleaned up");
        Ok(removed)
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn init_repo(&self) -> Result<()> {
        let this = self.clone();
        blocking(move || this.init_repo_sync()).await
    }

    async fn create_worktree(&self, agent: &AgentId) -> Result<PathBuf> {
        let this = self.clone();
        let agent = agent.clone();
        blocking(move || this.create_worktree_sync(&agent)).await
    }

    async fn commit(&self, agent: &AgentId, message: &str) -> Result<Option<String>> {
        let path = self.agent_path(agent);
        let message = message.to_string();
        blocking(move || commit_all(&path, &message)).await
    }

    async fn stats(&self, agent: &AgentId) -> Result<AgentPrStats> {
        let this = self.clone();
        let agent = agent.clone();
        blocking(move || this.stats_sync(&agent)).await
    }

    async fn cherry_pick(&self, agent: &AgentId) -> Result<CherryPick> {
        let this = self.clone();
        let agent = agent.clone();
        blocking(move || this.cherry_pick_sync(&agent)).await
    }

    async fn delivery_head(&self) -> Result<String> {
        let this = self.clone();
        blocking(move || {
            let repo = this.repo()?;
            let id = this.delivery_commit(&repo)?.id();
            Ok(id.to_string())
        })
        .await
    }

    async fn reset_delivery_to(&self, commit: &str) -> Result<()> {
        let this = self.clone();
        let commit = commit.to_string();
        blocking(move || this.reset_delivery_sync(&commit)).await
    }

    async fn sync_worktree_to_delivery(&self, agent: &AgentId) -> Result<()> {
        let this = self.clone();
        let agent = agent.clone();
        blocking(move || this.sync_worktree_sync(&agent)).await
    }

    fn delivery_path(&self) -> PathBuf {
        self.worktrees_dir.join(DELIVERY_WORKTREE)
    }

    async fn commit_delivery(&self, message: &str) -> Result<Option<String>> {
        let path = self.delivery_path();
        let message = message.to_string();
        blocking(move || commit_all(&path, &message)).await
    }

    async fn remove_worktree(&self, agent: &AgentId) -> Result<()> {
        let this = self.clone();
        let agent = agent.clone();
        blocking(move || this.remove_worktree_sync(&agent)).await
    }
}

fn base_ref(agent: &AgentId) -> String {
    format!("{}{}", BASE_REF_PREFIX, agent)
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("weave", "weave@localhost"))?)
}

fn is_worktree(path: &Path) -> bool {
    path.join(".git").exists() && Repository::open(path).is_ok()
}

fn initial_commit(repo: &Repository) -> Result<Commit<'_>> {
    info!("Repository has no commits, creating an initial one");
    let tree = repo.find_tree(repo.treebuilder(None)?.write()?)?;
    let sig = signature(repo)?;
    let id = repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])?;
    Ok(repo.find_commit(id)?)
}

/// Stage everything (including deletions) and commit on HEAD.
fn commit_all(worktree_path: &Path, message: &str) -> Result<Option<String>> {
    debug!(path = %worktree_path.display(), message, "commit_all");
    let repo = Repository::open(worktree_path)?;
    let mut index = repo.index()?;
    index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["."].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let parent = repo.head()?.peel_to_commit()?;
    if parent.tree_id() == tree_id {
        debug!("Nothing to commit");
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = signature(&repo)?;
    let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
    debug!(commit = %id, "Commit created");
    Ok(Some(id.to_string()))
}

fn conflict_paths(index: &Index) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref());
        if let Some(entry) = entry {
            files.push(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Prune a linked worktree and remove its directory and admin dir.
/// Succeeds if the worktree does not exist.
fn remove_linked_worktree(repo: &Repository, name: &str, path: &Path) -> Result<()> {
    if let Ok(worktree) = repo.find_worktree(name) {
        let _ = worktree.unlock();
        let pruned = worktree.prune(Some(
            WorktreePruneOptions::new()
                .valid(true)
                .working_tree(true)
                .locked(true),
        ));
        if let Err(e) = pruned {
            warn!(worktree = name, error = %e, "Worktree prune failed");
        }
    }

    if path.exists() {
        debug!(path = %path.display(), "Removing worktree directory");
        fs::remove_dir_all(path)?;
    }

    // Git considers the branch checked out while the admin dir exists.
    let admin_dir = repo.path().join("worktrees").join(name);
    if admin_dir.exists() {
        let _ = fs::remove_dir_all(&admin_dir);
    }
    Ok(())
}

fn delete_branch(repo: &Repository, name: &str) {
    match repo.find_branch(name, BranchType::Local) {
        Ok(mut branch) => {
            if let Err(e) = branch.delete() {
                warn!(branch = name, error = %e, "Failed to delete branch");
            }
        }
        Err(e) if e.code() == ErrorCode::NotFound => {}
        Err(e) => warn!(branch = name, error = %e, "Error looking up branch"),
    }
}
