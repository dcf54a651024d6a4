use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use url::Url;

use preview_core::artifact::Artifact;
use preview_core::controller::{Controller, ControllerSettings};
use preview_core::error::StoreError;
use preview_core::notify::{LifecycleReport, Notifier};
use preview_core::store::{
    Backoff, GitStoreClient, Identity, RetryPolicy, StoreClient, StoreSettings, WorkingCopy,
};
use preview_core::urls::DeploymentUrls;
use preview_core::verify::{Probe, VerifyPolicy};

pub const BRANCH: &str = "gh-pages";
pub const CONTAINER: &str = "pr-preview";

const GIT_ENV_OVERRIDES: [&str; 4] = [
    "GIT_DIR",
    "GIT_WORK_TREE",
    "GIT_INDEX_FILE",
    "GIT_COMMON_DIR",
];

pub fn git_command() -> Command {
    let mut cmd = Command::new("git");
    for key in GIT_ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    cmd.args([
        "-c",
        "user.name=Site Maintainer",
        "-c",
        "user.email=site@example.com",
        "-c",
        "commit.gpgsign=false",
        "-c",
        "init.defaultBranch=main",
    ]);
    cmd
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = git_command()
        .current_dir(dir)
        .args(args)
        .output()
        .expect("git should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create_dir_all should succeed");
    }
    fs::write(path, content).expect("write should succeed");
}

/// Bare repository standing in for the hosted site repository.
pub struct Remote {
    temp: TempDir,
    pub bare: PathBuf,
    pub work_dir: PathBuf,
}

impl Remote {
    /// A `gh-pages` branch carrying the production site.
    pub fn new() -> Self {
        let remote = Self::bare();
        remote.seed(BRANCH, &[("index.html", "<h1>docs</h1>")]);
        remote
    }

    /// A remote without the site branch.
    pub fn without_branch() -> Self {
        let remote = Self::bare();
        remote.seed("main", &[("README.md", "source")]);
        remote
    }

    fn bare() -> Self {
        let temp = TempDir::new().expect("tempdir should succeed");
        let bare = temp.path().join("site.git");
        let work_dir = temp.path().join("work");
        fs::create_dir_all(&bare).expect("create_dir_all should succeed");
        git(&bare, &["init", "--quiet", "--bare"]);
        Self {
            temp,
            bare,
            work_dir,
        }
    }

    fn seed(&self, branch: &str, files: &[(&str, &str)]) {
        let seed = self.temp.path().join(format!("seed-{}", branch));
        fs::create_dir_all(&seed).expect("create_dir_all should succeed");
        git(&seed, &["init", "--quiet"]);
        for (path, content) in files {
            write_file(&seed.join(path), content);
        }
        git(&seed, &["add", "--all"]);
        git(&seed, &["commit", "--quiet", "-m", "Initial site"]);
        let refspec = format!("HEAD:refs/heads/{}", branch);
        git(&seed, &["push", "--quiet", self.url(), &refspec]);
    }

    pub fn url(&self) -> &str {
        self.bare.to_str().expect("temp path should be UTF-8")
    }

    pub fn settings(&self) -> StoreSettings {
        StoreSettings {
            remote: self.url().to_string(),
            branch: BRANCH.to_string(),
            container: CONTAINER.to_string(),
            work_dir: self.work_dir.clone(),
            identity: Identity {
                name: "preview-bot".to_string(),
                email: "preview-bot@example.com".to_string(),
            },
            retry: fast_retry(3),
        }
    }

    pub fn client(&self) -> Arc<GitStoreClient> {
        Arc::new(GitStoreClient::new(self.settings()))
    }

    fn repo(&self) -> git2::Repository {
        git2::Repository::open_bare(&self.bare).expect("bare repo should open")
    }

    fn head_commit<'r>(&self, repo: &'r git2::Repository) -> git2::Commit<'r> {
        repo.find_branch(BRANCH, git2::BranchType::Local)
            .expect("site branch should exist")
            .get()
            .peel_to_commit()
            .expect("branch should point at a commit")
    }

    pub fn commit_count(&self) -> usize {
        let repo = self.repo();
        let head = self.head_commit(&repo).id();
        let mut walk = repo.revwalk().expect("revwalk should succeed");
        walk.push(head).expect("push should succeed");
        walk.count()
    }

    pub fn head_message(&self) -> String {
        let repo = self.repo();
        let commit = self.head_commit(&repo);
        commit.message().unwrap_or_default().to_string()
    }

    pub fn head_revision(&self) -> String {
        let repo = self.repo();
        self.head_commit(&repo).id().to_string()
    }

    /// Immediate children of `path` in the branch head; empty when absent.
    pub fn children(&self, path: &str) -> Vec<String> {
        let repo = self.repo();
        let tree = self.head_commit(&repo).tree().expect("commit should have a tree");
        let Ok(entry) = tree.get_path(Path::new(path)) else {
            return Vec::new();
        };
        let Ok(subtree) = repo.find_tree(entry.id()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = subtree
            .iter()
            .filter_map(|e| e.name().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    pub fn file(&self, path: &str) -> Option<String> {
        let repo = self.repo();
        let tree = self.head_commit(&repo).tree().expect("commit should have a tree");
        let entry = tree.get_path(Path::new(path)).ok()?;
        let blob = repo.find_blob(entry.id()).ok()?;
        Some(String::from_utf8_lossy(blob.content()).to_string())
    }

    pub fn has_container(&self) -> bool {
        let repo = self.repo();
        let tree = self.head_commit(&repo).tree().expect("commit should have a tree");
        tree.get_path(Path::new(CONTAINER)).is_ok()
    }

    /// Whether the container exists in the tree of `revision`.
    pub fn has_container_at(&self, revision: &str) -> bool {
        let repo = self.repo();
        let oid = git2::Oid::from_str(revision).expect("revision should be a commit id");
        let tree = repo
            .find_commit(oid)
            .expect("revision should exist in the remote")
            .tree()
            .expect("commit should have a tree");
        tree.get_path(Path::new(CONTAINER)).is_ok()
    }

    /// Checkout directories left behind by finished operations.
    pub fn leftover_checkouts(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.work_dir.join("checkouts")) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Push a slot from an independent clone, as a concurrent operation would.
pub fn push_slot(bare: &Path, id: u64, content: &str) {
    let scratch = TempDir::new().expect("tempdir should succeed");
    let dir = scratch.path().join("other");
    let dir_str = dir.to_str().expect("temp path should be UTF-8");
    let url = bare.to_str().expect("temp path should be UTF-8");
    git(
        scratch.path(),
        &["clone", "--quiet", "--branch", BRANCH, url, dir_str],
    );
    write_file(
        &dir.join(CONTAINER).join(id.to_string()).join("index.html"),
        content,
    );
    git(&dir, &["add", "--all"]);
    git(
        &dir,
        &["commit", "--quiet", "-m", &format!("Deploy preview for #{}", id)],
    );
    let refspec = format!("HEAD:refs/heads/{}", BRANCH);
    git(&dir, &["push", "--quiet", "origin", &refspec]);
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        delay: Duration::ZERO,
        backoff: Backoff::Fixed,
    }
}

/// A site build on disk.
pub struct SiteBuild {
    _temp: TempDir,
    pub artifact: Artifact,
}

pub fn site_build(files: &[(&str, &str)]) -> SiteBuild {
    let temp = TempDir::new().expect("tempdir should succeed");
    for (path, content) in files {
        write_file(&temp.path().join(path), content);
    }
    let artifact = Artifact::from_dir(temp.path());
    SiteBuild {
        _temp: temp,
        artifact,
    }
}

pub fn settings() -> ControllerSettings {
    ControllerSettings {
        retry: fast_retry(3),
        verify: Some(VerifyPolicy {
            max_attempts: 3,
            inter_delay: Duration::ZERO,
            initial_wait: Duration::ZERO,
            request_timeout: Duration::from_secs(1),
        }),
        gate_timeout: Duration::from_secs(30),
        operation_timeout: Duration::from_secs(120),
        urls: DeploymentUrls::new("acme", "github.io", "docs", CONTAINER)
            .expect("urls should build"),
    }
}

pub struct Harness {
    pub controller: Controller,
    pub notifier: Arc<RecordingNotifier>,
    pub probe: Arc<StaticProbe>,
}

pub fn harness(store: Arc<dyn StoreClient>, settings: ControllerSettings) -> Harness {
    let notifier = Arc::new(RecordingNotifier::default());
    let probe = Arc::new(StaticProbe::new(200));
    let controller = Controller::new(settings, store, probe.clone(), notifier.clone());
    Harness {
        controller,
        notifier,
        probe,
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    reports: Mutex<Vec<LifecycleReport>>,
}

impl RecordingNotifier {
    pub fn reports(&self) -> Vec<LifecycleReport> {
        self.reports.lock().expect("lock should succeed").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, report: &LifecycleReport) -> anyhow::Result<()> {
        self.reports
            .lock()
            .expect("lock should succeed")
            .push(report.clone());
        Ok(())
    }
}

pub struct StaticProbe {
    status: u16,
    pub calls: AtomicU32,
    urls: Mutex<Vec<String>>,
}

impl StaticProbe {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            calls: AtomicU32::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    /// URLs probed so far, in order.
    pub fn polled(&self) -> Vec<String> {
        self.urls.lock().expect("lock should succeed").clone()
    }
}

#[async_trait]
impl Probe for StaticProbe {
    async fn probe(&self, url: &Url) -> Result<u16, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls
            .lock()
            .expect("lock should succeed")
            .push(url.to_string());
        Ok(self.status)
    }
}

type Hook = Arc<dyn Fn(&Path) + Send + Sync>;

/// Counters shared by a [`FaultyStore`] and every working copy it hands out.
#[derive(Default)]
pub struct Faults {
    pub rejections: AtomicU32,
    pub pushes: AtomicU32,
    pub rebases: AtomicU32,
    pub checkouts: AtomicU32,
}

/// Wraps a real store, injecting push rejections and actions just before
/// the container is removed.
pub struct FaultyStore {
    inner: Arc<dyn StoreClient>,
    pub faults: Arc<Faults>,
    before_container_removal: Option<Hook>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn StoreClient>) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
            before_container_removal: None,
        }
    }

    /// Reject the next `n` pushes as if another writer had won the race.
    pub fn reject_pushes(self, n: u32) -> Self {
        self.faults.rejections.store(n, Ordering::SeqCst);
        self
    }

    /// Run `hook` with the working copy root right before the container is removed.
    pub fn before_container_removal(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.before_container_removal = Some(Arc::new(hook));
        self
    }
}

#[async_trait]
impl StoreClient for FaultyStore {
    async fn checkout(&self, label: &str) -> Result<Box<dyn WorkingCopy>, StoreError> {
        self.faults.checkouts.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.checkout(label).await?;
        Ok(Box::new(FaultyWorkingCopy {
            inner,
            faults: Arc::clone(&self.faults),
            before_container_removal: self.before_container_removal.clone(),
        }))
    }

    fn container(&self) -> &str {
        self.inner.container()
    }
}

struct FaultyWorkingCopy {
    inner: Box<dyn WorkingCopy>,
    faults: Arc<Faults>,
    before_container_removal: Option<Hook>,
}

#[async_trait]
impl WorkingCopy for FaultyWorkingCopy {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn container(&self) -> &str {
        self.inner.container()
    }

    async fn stage(&mut self, rel: &str) -> Result<bool, StoreError> {
        self.inner.stage(rel).await
    }

    async fn stage_removal(&mut self, rel: &str) -> Result<bool, StoreError> {
        self.inner.stage_removal(rel).await
    }

    async fn stage_container_removal(&mut self) -> Result<(), StoreError> {
        if let Some(hook) = &self.before_container_removal {
            hook(self.inner.root());
        }
        self.inner.stage_container_removal().await
    }

    async fn commit(&mut self, message: &str) -> Result<String, StoreError> {
        self.inner.commit(message).await
    }

    async fn amend(&mut self, message: &str) -> Result<String, StoreError> {
        self.inner.amend(message).await
    }

    async fn push(&mut self) -> Result<(), StoreError> {
        self.faults.pushes.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .faults
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Rejected {
                message: "! [rejected] HEAD -> gh-pages (fetch first)".to_string(),
            });
        }
        self.inner.push().await
    }

    async fn rebase(&mut self) -> Result<(), StoreError> {
        self.faults.rebases.fetch_add(1, Ordering::SeqCst);
        self.inner.rebase().await
    }
}
