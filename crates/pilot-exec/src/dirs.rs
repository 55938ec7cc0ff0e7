//! Working-directory layout of a pilot run.
//!
//! ```text
//! <root>/
//!   data-hub/                 shared, written by the init step, read-only for tasks
//!   init/{outputs,task-io}/   the init step
//!   tasks/<task-id>/
//!     outputs/{stdoutfile,stderrfile}
//!     task-io/{infile-<id>.<ext>,outfile-<id>.<ext>}
//! ```

use std::{
    io,
    path::{Path, PathBuf},
};

use pilot_model::{BindMount, Platform};
use tokio::fs;
use tracing::{debug, warn};

pub const DATA_HUB_DIR: &str = "data-hub";
pub const TASKS_DIR: &str = "tasks";
pub const INIT_DIR: &str = "init";
pub const OUTPUTS_DIR: &str = "outputs";
pub const TASK_IO_DIR: &str = "task-io";
pub const STDOUT_FILE: &str = "stdoutfile";
pub const STDERR_FILE: &str = "stderrfile";

/// Where the run root appears inside a container.
pub const CONTAINER_ROOT: &str = "/pilot-data";

/// A directory as seen by the pilot and as seen by the task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirPair {
    pub on_host: PathBuf,
    pub in_task: PathBuf,
}

impl DirPair {
    pub fn join(&self, name: &str) -> DirPair {
        DirPair {
            on_host: self.on_host.join(name),
            in_task: self.in_task.join(name),
        }
    }
}

/// Root of one run's working directories.
#[derive(Clone, Debug)]
pub struct WorkDir {
    root: PathBuf,
    in_task_root: PathBuf,
    data_hub: DirPair,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>, platform: Platform) -> Self {
        let root = root.into();
        // Tasks run with their own directory as cwd.
        let root = std::path::absolute(&root).unwrap_or(root);
        let in_task_root = if platform.is_container() {
            PathBuf::from(CONTAINER_ROOT)
        } else {
            root.clone()
        };
        let data_hub = DirPair {
            on_host: root.join(DATA_HUB_DIR),
            in_task: in_task_root.join(DATA_HUB_DIR),
        };
        Self {
            root,
            in_task_root,
            data_hub,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_hub(&self) -> &DirPair {
        &self.data_hub
    }

    /// Create the shared directories. Idempotent.
    pub async fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_hub.on_host).await?;
        fs::create_dir_all(self.root.join(TASKS_DIR)).await
    }

    /// Fresh private directories for one task. Never shared with another task.
    pub async fn task_catalog(&self, name: &str) -> io::Result<DirectoryCatalog> {
        DirectoryCatalog::create(self, &self.root.join(TASKS_DIR), name).await
    }

    /// Directories reserved for the init step.
    pub async fn init_catalog(&self) -> io::Result<DirectoryCatalog> {
        DirectoryCatalog::create(self, &self.root, INIT_DIR).await
    }

    /// Remove what this run created, unless task directories were kept for inspection.
    ///
    /// Returns `true` when the run root is gone.
    pub async fn cleanup(&self) -> bool {
        let tasks = self.root.join(TASKS_DIR);
        if !dir_is_empty(&tasks).await {
            debug!(target: "pilot.exec.dirs", root = %self.root.display(), "task directories left; keeping run root");
            return false;
        }
        for sub in [DATA_HUB_DIR, INIT_DIR, TASKS_DIR] {
            let p = self.root.join(sub);
            if let Err(e) = fs::remove_dir_all(&p).await
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(target: "pilot.exec.dirs", path = %p.display(), error = %e, "cleanup failed");
            }
        }
        // Only removed when nothing foreign lives there.
        fs::remove_dir(&self.root).await.is_ok()
    }
}

async fn dir_is_empty(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut rd) => matches!(rd.next_entry().await, Ok(None)),
        Err(_) => true,
    }
}

/// Per-task (or init) directories and the paths they map to inside the task.
#[derive(Clone, Debug)]
pub struct DirectoryCatalog {
    dir: PathBuf,
    outputs: PathBuf,
    task_io: DirPair,
    data_hub: DirPair,
}

impl DirectoryCatalog {
    async fn create(work: &WorkDir, parent: &Path, name: &str) -> io::Result<Self> {
        fs::create_dir_all(parent).await?;

        // A redelivered message may find its previous (failed, kept) directory.
        let mut dir = parent.join(name);
        let mut attempt = 1;
        loop {
            match fs::create_dir(&dir).await {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                    dir = parent.join(format!("{name}-{attempt}"));
                }
                Err(e) => return Err(e),
            }
        }

        let outputs = dir.join(OUTPUTS_DIR);
        fs::create_dir(&outputs).await?;
        let io_host = dir.join(TASK_IO_DIR);
        fs::create_dir(&io_host).await?;

        let io_in_task = if work.in_task_root == work.root {
            io_host.clone()
        } else {
            work.in_task_root.join(TASK_IO_DIR)
        };

        Ok(Self {
            dir,
            outputs,
            task_io: DirPair {
                on_host: io_host,
                in_task: io_in_task,
            },
            data_hub: work.data_hub.clone(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stdout_file(&self) -> PathBuf {
        self.outputs.join(STDOUT_FILE)
    }

    pub fn stderr_file(&self) -> PathBuf {
        self.outputs.join(STDERR_FILE)
    }

    pub fn task_io(&self) -> &DirPair {
        &self.task_io
    }

    pub fn data_hub(&self) -> &DirPair {
        &self.data_hub
    }

    /// A file inside the task-io directory.
    pub fn io_file(&self, name: &str) -> DirPair {
        self.task_io.join(name)
    }

    /// Binds for a container run: the data hub, external directories (read-only), and the task-io dir.
    pub fn bind_mounts(&self, external: &[PathBuf], hub_readonly: bool) -> Vec<BindMount> {
        let mut hub = BindMount::new(&self.data_hub.on_host, &self.data_hub.in_task);
        if hub_readonly {
            hub = hub.readonly();
        }
        let mut mounts = vec![hub];
        mounts.extend(
            external
                .iter()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| BindMount::readonly_same_path(p.clone())),
        );
        mounts.push(BindMount::new(&self.task_io.on_host, &self.task_io.in_task));
        mounts
    }

    pub async fn remove(&self) -> io::Result<()> {
        fs::remove_dir_all(&self.dir).await
    }
}
