//! Git plumbing for per-user state branches.
//!
//! Each user owns the branch `binsync/<user>`; its tree is the serialized
//! state (see [`crate::state::wire`]). The branch `binsync/__root__` anchors
//! every user branch and records the hash of the binary being analysed.
//! Nothing here touches a working tree: trees are built from blobs and
//! committed straight onto the refs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;
use git2::{
    Commit, ErrorCode, FetchOptions, ObjectType, Oid, Repository, Signature, TreeWalkMode,
    TreeWalkResult,
};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::state::wire::{StateFiles, METADATA_FILE};

pub const BRANCH_PREFIX: &str = "binsync";
pub const ROOT_USER: &str = "__root__";
pub const BINARY_HASH_FILE: &str = "binary_hash";
pub const LOCK_FILE: &str = "binsync.lock";

const FILE_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;

fn local_ref(user: &str) -> String {
    format!("refs/heads/{BRANCH_PREFIX}/{user}")
}

pub struct GitStore {
    repo: Repository,
    remote: String,
    /// Held for the lifetime of the store; the OS lock drops with it.
    _lock: File,
}

impl GitStore {
    /// Create a fresh repository at `path` with a root branch recording
    /// `binary_hash`, optionally pointing `remote` at `remote_url`.
    pub fn init(
        path: &Path,
        remote: &str,
        remote_url: Option<&str>,
        binary_hash: &str,
    ) -> SyncResult<Self> {
        if Repository::open(path).is_ok() {
            return Err(SyncError::RepositoryExists(path.to_path_buf()));
        }
        std::fs::create_dir_all(path)?;
        let repo = Repository::init(path)?;
        {
            let blob = repo.blob(binary_hash.as_bytes())?;
            let mut builder = repo.treebuilder(None)?;
            builder.insert(BINARY_HASH_FILE, blob, FILE_MODE)?;
            let tree = repo.find_tree(builder.write()?)?;
            let sig = signature(ROOT_USER)?;
            repo.commit(Some(&local_ref(ROOT_USER)), &sig, &sig, "Initialize binsync", &tree, &[])?;
        }
        if let Some(url) = remote_url {
            repo.remote(remote, url)?;
        }
        info!(path = %path.display(), "initialized sync repository");
        Self::locked(repo, remote)
    }

    /// Create a local repository tracking `url` and fetch every state branch.
    pub fn clone_from(url: &str, path: &Path, remote: &str) -> SyncResult<Self> {
        if Repository::open(path).is_ok() {
            return Err(SyncError::RepositoryExists(path.to_path_buf()));
        }
        std::fs::create_dir_all(path)?;
        let repo = Repository::init(path)?;
        repo.remote(remote, url)?;
        let store = Self::locked(repo, remote)?;
        store.fetch()?;
        let tracked_root = store.remote_ref(ROOT_USER);
        let root = store.repo.refname_to_id(&tracked_root).map_err(|_| {
            SyncError::RemoteUnavailable(format!("{url} has no {BRANCH_PREFIX}/{ROOT_USER} branch"))
        })?;
        store.repo.reference(&local_ref(ROOT_USER), root, false, "binsync: track root")?;
        info!(url, path = %path.display(), "cloned sync repository");
        Ok(store)
    }

    pub fn open(path: &Path, remote: &str) -> SyncResult<Self> {
        let repo = Repository::open(path)?;
        Self::locked(repo, remote)
    }

    fn locked(repo: Repository, remote: &str) -> SyncResult<Self> {
        let lock_path = repo.path().join(LOCK_FILE);
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&lock_path)?;
        file.try_lock_exclusive().map_err(|_| SyncError::Lock(lock_path))?;
        Ok(Self { repo, remote: remote.to_string(), _lock: file })
    }

    pub fn path(&self) -> &Path {
        self.repo.workdir().unwrap_or_else(|| self.repo.path())
    }

    pub fn remote_name(&self) -> &str {
        &self.remote
    }

    pub fn has_remote(&self) -> bool {
        !self.remote.is_empty() && self.repo.find_remote(&self.remote).is_ok()
    }

    pub fn remote_url(&self) -> Option<String> {
        let remote = self.repo.find_remote(&self.remote).ok()?;
        remote.url().map(str::to_string)
    }

    fn remote_ref(&self, user: &str) -> String {
        format!("refs/remotes/{}/{BRANCH_PREFIX}/{user}", self.remote)
    }

    fn ref_target(&self, name: &str) -> SyncResult<Option<Oid>> {
        match self.repo.refname_to_id(name) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Latest commit of `user`'s branch. Own branches prefer the local ref,
    /// everyone else's prefer what was last fetched.
    pub fn user_tip(&self, user: &str, prefer_local: bool) -> SyncResult<Option<Oid>> {
        let (first, second) = if prefer_local {
            (local_ref(user), self.remote_ref(user))
        } else {
            (self.remote_ref(user), local_ref(user))
        };
        match self.ref_target(&first)? {
            Some(oid) => Ok(Some(oid)),
            None => self.ref_target(&second),
        }
    }

    /// Hash recorded on the root branch, if any.
    pub fn binary_hash(&self) -> SyncResult<Option<String>> {
        let Some(tip) = self.user_tip(ROOT_USER, true)? else {
            return Ok(None);
        };
        let tree = self.repo.find_commit(tip)?.tree()?;
        let Some(entry) = tree.get_name(BINARY_HASH_FILE) else {
            return Ok(None);
        };
        let blob = self.repo.find_blob(entry.id())?;
        Ok(Some(String::from_utf8_lossy(blob.content()).trim().to_string()))
    }

    /// Every user with a state branch, locally or on the remote, in ref
    /// name order. Branches without `metadata.toml` are not users.
    pub fn users(&self) -> SyncResult<Vec<String>> {
        let local_prefix = format!("refs/heads/{BRANCH_PREFIX}/");
        let remote_prefix = format!("refs/remotes/{}/{BRANCH_PREFIX}/", self.remote);
        let mut names = BTreeSet::new();
        for prefix in [&local_prefix, &remote_prefix] {
            for reference in self.repo.references_glob(&format!("{prefix}*"))? {
                let reference = reference?;
                let Some(name) = reference.name().and_then(|n| n.strip_prefix(prefix.as_str()))
                else {
                    continue;
                };
                if name == ROOT_USER {
                    continue;
                }
                names.insert(name.to_string());
            }
        }

        let mut users = Vec::with_capacity(names.len());
        for name in names {
            let has_metadata = match self.user_tip(&name, false)? {
                Some(tip) => self.repo.find_commit(tip)?.tree()?.get_name(METADATA_FILE).is_some(),
                None => false,
            };
            if has_metadata {
                users.push(name);
            } else {
                debug!(user = %name, "skipping branch without metadata");
            }
        }
        Ok(users)
    }

    pub fn commit_time(&self, oid: Oid) -> SyncResult<i64> {
        Ok(self.repo.find_commit(oid)?.time().seconds())
    }

    /// All blobs reachable from `commit`'s tree, keyed by slash-separated path.
    pub fn read_files(&self, commit: Oid) -> SyncResult<StateFiles> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        let mut blobs = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    blobs.push((format!("{root}{name}"), entry.id()));
                }
            }
            TreeWalkResult::Ok
        })?;

        let mut files = StateFiles::new();
        for (path, oid) in blobs {
            let blob = self.repo.find_blob(oid)?;
            files.insert(path, blob.content().to_vec());
        }
        Ok(files)
    }

    fn write_tree(&self, files: &StateFiles) -> SyncResult<Oid> {
        let mut here: Vec<(&str, &[u8])> = Vec::new();
        let mut dirs: BTreeMap<&str, StateFiles> = BTreeMap::new();
        for (path, bytes) in files {
            match path.split_once('/') {
                Some((dir, rest)) => {
                    dirs.entry(dir).or_default().insert(rest.to_string(), bytes.clone());
                }
                None => here.push((path.as_str(), bytes.as_slice())),
            }
        }

        let mut builder = self.repo.treebuilder(None)?;
        for (name, bytes) in here {
            let blob = self.repo.blob(bytes)?;
            builder.insert(name, blob, FILE_MODE)?;
        }
        for (dir, children) in dirs {
            let subtree = self.write_tree(&children)?;
            builder.insert(dir, subtree, TREE_MODE)?;
        }
        Ok(builder.write()?)
    }

    /// Commit `files` as the new state of `user`.
    ///
    /// Returns `None` when the tree is identical to the current tip.
    pub fn write_state(&self, user: &str, files: &StateFiles, message: &str) -> SyncResult<Option<Oid>> {
        let tree_id = self.write_tree(files)?;
        let tree = self.repo.find_tree(tree_id)?;
        let refname = local_ref(user);

        let local_tip = self.ref_target(&refname)?;
        let parent_id = match local_tip {
            Some(oid) => Some(oid),
            None => match self.ref_target(&self.remote_ref(user))? {
                Some(oid) => Some(oid),
                None => self.user_tip(ROOT_USER, true)?,
            },
        };
        let parent: Option<Commit<'_>> = match parent_id {
            Some(oid) => Some(self.repo.find_commit(oid)?),
            None => None,
        };
        if let Some(parent) = &parent {
            if local_tip.is_some() && parent.tree_id() == tree_id {
                return Ok(None);
            }
        }

        let sig = signature(user)?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = if local_tip.is_some() {
            self.repo.commit(Some(&refname), &sig, &sig, message, &tree, &parents)?
        } else {
            let oid = self.repo.commit(None, &sig, &sig, message, &tree, &parents)?;
            self.repo.reference(&refname, oid, true, "binsync: create user branch")?;
            oid
        };
        debug!(user, commit = %oid, "committed state");
        Ok(Some(oid))
    }

    /// Fetch every state branch from the remote.
    pub fn fetch(&self) -> SyncResult<()> {
        let mut remote = self.repo.find_remote(&self.remote)?;
        let refspec = format!(
            "+refs/heads/{BRANCH_PREFIX}/*:refs/remotes/{}/{BRANCH_PREFIX}/*",
            self.remote
        );
        let mut opts = FetchOptions::new();
        remote.fetch(&[refspec.as_str()], Some(&mut opts), None)?;
        Ok(())
    }

    /// Push the root branch and `user`'s branch, then record what the remote
    /// now holds.
    pub fn push(&self, user: &str) -> SyncResult<()> {
        let mut remote = self.repo.find_remote(&self.remote)?;
        let mut specs = vec![format!("{0}:{0}", local_ref(ROOT_USER))];
        let user_tip = self.ref_target(&local_ref(user))?;
        if user_tip.is_some() {
            specs.push(format!("+{0}:{0}", local_ref(user)));
        }
        let specs: Vec<&str> = specs.iter().map(String::as_str).collect();
        remote.push(&specs, None)?;

        if let Some(oid) = user_tip {
            self.repo.reference(&self.remote_ref(user), oid, true, "binsync: push")?;
        }
        Ok(())
    }
}

fn signature(user: &str) -> SyncResult<Signature<'static>> {
    Ok(Signature::now(user, &format!("{user}@binsync"))?)
}
