//! Git provider against a bare repository on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use filing_core::{EventBus, FilingError, FilingEvent, FilingProvider};
use filing_local::git::{FetchAction, GitPhase};
use filing_local::{CommitQueue, GitFilingProvider, GitOptions, MemoryLockManager};
use git2::{Repository, RepositoryInitOptions, Signature};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// Bare `origin.git` whose `main` holds one commit with README.md.
fn setup() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("origin.git");
    let mut bare_opts = RepositoryInitOptions::new();
    bare_opts.bare(true).initial_head("main");
    Repository::init_opts(&origin, &bare_opts).unwrap();

    let seed_dir = temp.path().join("seed");
    let mut seed_opts = RepositoryInitOptions::new();
    seed_opts.initial_head("main");
    let seed = Repository::init_opts(&seed_dir, &seed_opts).unwrap();
    std::fs::write(seed_dir.join("README.md"), "seed\n").unwrap();

    let mut index = seed.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree = seed.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("seed", "seed@localhost").unwrap();
    seed.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();

    let mut remote = seed
        .remote("origin", origin.to_str().unwrap())
        .unwrap();
    remote
        .push(&["refs/heads/main:refs/heads/main"], None)
        .unwrap();

    (temp, origin)
}

fn options(origin: &Path, user: &str) -> GitOptions {
    GitOptions::new(origin.to_str().unwrap(), user)
}

async fn provider(root: &Path, options: GitOptions, events: EventBus) -> GitFilingProvider {
    let user = options.user_id.clone();
    let provider = GitFilingProvider::new(
        options,
        root.join(&user).join("work"),
        Arc::new(CommitQueue::new(root.join(&user).join("queue"))),
        events,
    );
    provider.initialize().await.unwrap();
    provider
}

fn origin_tip(origin: &Path) -> String {
    Repository::open_bare(origin)
        .unwrap()
        .refname_to_id("refs/heads/main")
        .unwrap()
        .to_string()
}

async fn only_pending_id(provider: &GitFilingProvider) -> String {
    let pending = provider.pending_commits().await;
    assert_eq!(pending.len(), 1, "expected one pending commit: {pending:?}");
    pending[0].id.clone()
}

#[tokio::test]
async fn test_initialize_clones_the_branch() {
    let (temp, origin) = setup();
    let alice = provider(temp.path(), options(&origin, "alice"), EventBus::default()).await;

    assert_eq!(alice.phase().await, GitPhase::Ready);
    assert_eq!(alice.read("README.md").await.unwrap(), b"seed\n");
    let names: Vec<String> = alice
        .list("")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["README.md".to_string()]);

    // A second initialize reuses the clone
    assert_ok!(alice.initialize().await);
}

#[tokio::test]
async fn test_create_commit_and_push() {
    let (temp, origin) = setup();
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let alice = provider(temp.path(), options(&origin, "alice"), events).await;

    assert_ok!(alice.create("docs/a.md", b"hello").await);
    let commit_id = only_pending_id(&alice).await;

    let status = alice.get_status().await.unwrap();
    assert_eq!(status.pending_commits, 1);
    assert!(status.git.staged.contains(&"docs/a.md".to_string()));

    let sha = alice
        .commit_with_message(&commit_id, "Add a.md", "alice")
        .await
        .unwrap();
    assert!(alice.pending_commits().await.is_empty());

    assert_ok!(alice.push().await);
    assert_eq!(origin_tip(&origin), sha);

    let mut saw_push = false;
    while let Ok(event) = rx.try_recv() {
        if let FilingEvent::GitPushed { branch } = event {
            assert_eq!(branch, "main");
            saw_push = true;
        }
    }
    assert!(saw_push);
}

#[tokio::test]
async fn test_synchronize_fast_forwards_other_clone() {
    let (temp, origin) = setup();
    let alice = provider(temp.path(), options(&origin, "alice"), EventBus::default()).await;
    let bob = provider(temp.path(), options(&origin, "bob"), EventBus::default()).await;

    assert_ok!(alice.create("shared.md", b"from alice").await);
    let id = only_pending_id(&alice).await;
    assert_ok!(alice.commit_with_message(&id, "Share", "alice").await);
    assert_ok!(alice.push().await);

    let summary = bob.synchronize().await.unwrap();
    assert_eq!(summary.synced, 1);
    assert_eq!(bob.read("shared.md").await.unwrap(), b"from alice");

    let report = bob.fetch().await.unwrap();
    assert_eq!(report.action, FetchAction::UpToDate);
}

#[tokio::test]
async fn test_commit_requires_owner_and_message() {
    let (temp, origin) = setup();
    let alice = provider(temp.path(), options(&origin, "alice"), EventBus::default()).await;

    assert_ok!(alice.update("README.md", b"changed\n").await);
    let id = only_pending_id(&alice).await;

    let err = assert_err!(alice.commit_with_message(&id, "mine now", "mallory").await);
    assert!(matches!(err, FilingError::Ownership(_)));
    let err = assert_err!(alice.commit_with_message(&id, "   ", "alice").await);
    assert!(matches!(err, FilingError::InvalidArgument(_)));
    assert_eq!(only_pending_id(&alice).await, id);

    let cancelled = alice.cancel_pending_commit(&id, "alice").await.unwrap();
    assert_eq!(cancelled.files, vec!["README.md".to_string()]);
    assert!(alice.pending_commits().await.is_empty());
}

#[tokio::test]
async fn test_failed_commit_is_requeued() {
    let (temp, origin) = setup();
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let mut opts = options(&origin, "alice");
    opts.author_name = "bad<name>".to_string();
    let alice = provider(temp.path(), opts, events).await;

    assert_ok!(alice.create("a.md", b"x").await);
    let id = only_pending_id(&alice).await;

    let err = assert_err!(alice.commit_with_message(&id, "Add a.md", "alice").await);
    assert!(matches!(err, FilingError::Git(_)));

    let pending = alice.pending_commits().await;
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].id, id);
    assert_eq!(pending[0].files, vec!["a.md".to_string()]);
    assert!(pending[0].metadata.retry);
    assert_eq!(pending[0].metadata.attempts, 1);

    let mut requeued = None;
    while let Ok(event) = rx.try_recv() {
        if let FilingEvent::CommitRequeued {
            commit_id,
            previous_id,
            ..
        } = event
        {
            requeued = Some((commit_id, previous_id));
        }
    }
    assert_eq!(requeued, Some((pending[0].id.clone(), id)));
}

#[tokio::test]
async fn test_conflicting_divergence_resets_to_origin() {
    let (temp, origin) = setup();
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let alice = provider(temp.path(), options(&origin, "alice"), events).await;
    let bob = provider(temp.path(), options(&origin, "bob"), EventBus::default()).await;

    assert_ok!(bob.update("README.md", b"bob\n").await);
    let id = only_pending_id(&bob).await;
    let bob_sha = bob.commit_with_message(&id, "Bob edit", "bob").await.unwrap();
    assert_ok!(bob.push().await);

    assert_ok!(alice.update("README.md", b"alice\n").await);
    let id = only_pending_id(&alice).await;
    assert_ok!(alice.commit_with_message(&id, "Alice edit", "alice").await);
    assert_ok!(alice.create("notes.md", b"unsent").await);

    let report = alice.fetch().await.unwrap();
    assert_eq!(report.action, FetchAction::ResetToRemote);
    assert_eq!((report.ahead, report.behind), (1, 1));
    assert!(bob_sha.starts_with(report.head.as_deref().unwrap()));
    assert_eq!(alice.read("README.md").await.unwrap(), b"bob\n");

    let mut resolved = None;
    while let Ok(event) = rx.try_recv() {
        if let FilingEvent::GitConflictsResolved {
            affected_pending_files,
            ..
        } = event
        {
            resolved = Some(affected_pending_files);
        }
    }
    assert_eq!(resolved, Some(vec!["notes.md".to_string()]));
}

#[tokio::test]
async fn test_fetch_discards_uncommitted_edit_on_conflict() {
    let (temp, origin) = setup();
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let alice = provider(temp.path(), options(&origin, "alice"), events).await;
    let bob = provider(temp.path(), options(&origin, "bob"), EventBus::default()).await;

    // Staged and queued, never committed
    assert_ok!(alice.update("README.md", b"alice\n").await);

    assert_ok!(bob.update("README.md", b"bob\n").await);
    let id = only_pending_id(&bob).await;
    assert_ok!(bob.commit_with_message(&id, "Bob edit", "bob").await);
    assert_ok!(bob.push().await);

    let report = alice.fetch().await.unwrap();
    assert_eq!(report.action, FetchAction::ResetToRemote);
    assert_eq!(alice.read("README.md").await.unwrap(), b"bob\n");
    let status = alice.get_status().await.unwrap();
    assert!(status.git.staged.is_empty());
    assert!(status.git.modified.is_empty());

    let mut resolved = None;
    while let Ok(event) = rx.try_recv() {
        if let FilingEvent::GitConflictsResolved {
            affected_pending_files,
            ..
        } = event
        {
            resolved = Some(affected_pending_files);
        }
    }
    assert_eq!(resolved, Some(vec!["README.md".to_string()]));
}

#[tokio::test]
async fn test_second_commit_of_same_content_is_refused() {
    let (temp, origin) = setup();
    let alice = provider(temp.path(), options(&origin, "alice"), EventBus::default()).await;

    assert_ok!(alice.create("a.md", b"1").await);
    assert_ok!(alice.update("a.md", b"2").await);
    let pending = alice.pending_commits().await;
    assert_eq!(pending.len(), 2);

    let sha = alice
        .commit_with_message(&pending[0].id, "Add a.md", "alice")
        .await
        .unwrap();
    let repo = Repository::open(temp.path().join("alice/work")).unwrap();
    let tree = repo
        .find_commit(git2::Oid::from_str(&sha).unwrap())
        .unwrap()
        .tree()
        .unwrap();
    let blob = repo
        .find_blob(tree.get_path(Path::new("a.md")).unwrap().id())
        .unwrap();
    assert_eq!(blob.content(), b"2");

    let err = assert_err!(
        alice
            .commit_with_message(&pending[1].id, "Update a.md", "alice")
            .await
    );
    assert!(matches!(err, FilingError::InvalidArgument(_)));
    assert!(alice.pending_commits().await.is_empty());
    assert_eq!(
        repo.head().unwrap().peel_to_commit().unwrap().id().to_string(),
        sha
    );
}

#[tokio::test]
async fn test_foreign_lock_blocks_mutations() {
    let (temp, origin) = setup();
    let locks = Arc::new(MemoryLockManager::new());
    let root = temp.path();

    let alice = GitFilingProvider::new(
        options(&origin, "alice"),
        root.join("alice/work"),
        Arc::new(CommitQueue::new(root.join("alice/queue"))),
        EventBus::default(),
    )
    .with_lock_manager(locks.clone());
    alice.initialize().await.unwrap();
    let bob = GitFilingProvider::new(
        options(&origin, "bob"),
        root.join("bob/work"),
        Arc::new(CommitQueue::new(root.join("bob/queue"))),
        EventBus::default(),
    )
    .with_lock_manager(locks);
    bob.initialize().await.unwrap();

    assert_ok!(bob.lock_file("README.md", "rewriting").await);
    match assert_err!(alice.update("README.md", b"alice").await) {
        FilingError::LockConflict { holder, .. } => assert_eq!(holder, "bob"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        assert_err!(alice.unlock_file("README.md").await),
        FilingError::Ownership(_)
    ));
    assert_eq!(
        alice.get_status().await.unwrap().locked_paths,
        vec!["README.md".to_string()]
    );

    assert_ok!(bob.unlock_file("README.md").await);
    assert_ok!(alice.update("README.md", b"alice").await);
}
