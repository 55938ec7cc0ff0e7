use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
    time::Instant,
};

use async_trait::async_trait;
use pilot_core::{Runner, TaskError};
use pilot_model::{FileType, Payload, Platform, RunSpec, TaskEnv, TaskId};
use tokio::{
    fs,
    io::{AsyncWrite, AsyncWriteExt},
    process::Command,
};
use tracing::{debug, info, trace, warn};

use crate::{
    codec,
    container::{self, ContainerConfig, DATA_HUB_ENV, Placeholders},
    dirs::{DirPair, DirectoryCatalog, WorkDir},
    error::{ExecError, ExecResult},
    logparse::extract_error,
    util::{GroupGuard, KILL_GRACE, kill_graceful},
};

/// Execution settings shared by the task and the init step.
#[derive(Clone, Debug)]
pub struct ExecConfig {
    /// Root of the run's working directories.
    pub root: PathBuf,
    pub platform: Platform,
    pub infile_type: FileType,
    pub outfile_type: FileType,
    /// Keep every task directory, successful or not.
    pub keep_files: bool,
    /// Copy each task's stdout/stderr capture to the pilot's own after it ends.
    /// Failed tasks are always dumped.
    pub dump_output: bool,
    /// Copy captured task stdout to the pilot's stderr; set when the pilot's stdout carries results.
    pub dump_to_stderr: bool,
    /// Host directories mounted read-only into every container at the same path.
    pub external_dirs: Vec<PathBuf>,
    pub container: ContainerConfig,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./pilot-data"),
            platform: Platform::Process,
            infile_type: FileType::Text,
            outfile_type: FileType::Text,
            keep_files: false,
            dump_output: false,
            dump_to_stderr: false,
            external_dirs: Vec::new(),
            container: ContainerConfig::default(),
        }
    }
}

impl ExecConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_file_types(mut self, infile: FileType, outfile: FileType) -> Self {
        self.infile_type = infile;
        self.outfile_type = outfile;
        self
    }

    pub fn with_keep_files(mut self, keep: bool) -> Self {
        self.keep_files = keep;
        self
    }

    pub fn with_dump_output(mut self, dump: bool) -> Self {
        self.dump_output = dump;
        self
    }

    pub fn with_dump_to_stderr(mut self, on: bool) -> Self {
        self.dump_to_stderr = on;
        self
    }

    /// Stream the captured task stdout is copied to.
    pub fn stdout_dump_stream(&self) -> DumpStream {
        if self.dump_to_stderr {
            DumpStream::Stderr
        } else {
            DumpStream::Stdout
        }
    }

    pub fn with_external_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.external_dirs.push(dir.into());
        self
    }

    pub fn with_container(mut self, container: ContainerConfig) -> Self {
        self.container = container;
        self
    }
}

/// The pilot's own stream a task capture is copied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpStream {
    Stdout,
    Stderr,
}

/// Runs each task (and the optional init step) through `sh -c`, on the host or in a container.
///
/// Per task: the input payload is written to `task-io/infile-<id>.<ext>`, the command runs with its
/// stdout/stderr captured under `outputs/`, and `task-io/outfile-<id>.<ext>` is decoded as the result.
pub struct ProcRunner {
    cfg: ExecConfig,
    work: WorkDir,
    task: RunSpec,
    init: Option<RunSpec>,
    task_image: OnceLock<String>,
    init_image: OnceLock<String>,
}

impl ProcRunner {
    pub fn new(cfg: ExecConfig, task: RunSpec) -> Self {
        let work = WorkDir::new(cfg.root.clone(), cfg.platform);
        Self {
            cfg,
            work,
            task,
            init: None,
            task_image: OnceLock::new(),
            init_image: OnceLock::new(),
        }
    }

    /// One-time step run before the first task; it may write to the data hub.
    pub fn with_init(mut self, init: RunSpec) -> Self {
        self.init = (!init.is_empty()).then_some(init);
        self
    }

    pub fn config(&self) -> &ExecConfig {
        &self.cfg
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work
    }

    async fn execute(&self, id: &TaskId, input: Payload) -> ExecResult<Payload> {
        let cat = self
            .work
            .task_catalog(id.as_str())
            .await
            .map_err(|e| ExecError::Setup(format!("task directory for {id}: {e}")))?;
        let infile = cat.io_file(&format!("infile-{id}.{}", self.cfg.infile_type.extension()));
        let outfile = cat.io_file(&format!("outfile-{id}.{}", self.cfg.outfile_type.extension()));

        let result = self.stage_and_run(id, input, &cat, &infile, &outfile).await;
        self.after(&cat, id.as_str(), result.is_err()).await;
        result
    }

    async fn stage_and_run(
        &self,
        id: &TaskId,
        input: Payload,
        cat: &DirectoryCatalog,
        infile: &DirPair,
        outfile: &DirPair,
    ) -> ExecResult<Payload> {
        let bytes = codec::encode(self.cfg.infile_type, &input)?;
        fs::write(&infile.on_host, bytes).await?;

        let image = resolved(&self.task_image, &self.task);
        let ph = Placeholders {
            infile: &infile.in_task,
            outfile: &outfile.in_task,
            data_hub: &cat.data_hub().in_task,
        };
        self.invoke(id.as_str(), &self.task, image, cat, &ph, true).await?;

        match fs::read(&outfile.on_host).await {
            Ok(bytes) => codec::decode(self.cfg.outfile_type, bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ExecError::MissingOutput(
                outfile.on_host.display().to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Spawn, wait (bounded by the spec's timeout) and map the exit status.
    async fn invoke(
        &self,
        label: &str,
        spec: &RunSpec,
        image: &str,
        cat: &DirectoryCatalog,
        ph: &Placeholders<'_>,
        hub_readonly: bool,
    ) -> ExecResult<()> {
        let platform = self.cfg.platform;
        let args = container::substitute(&spec.args, ph);
        let env = spec.env.merged(
            &TaskEnv::new().with(DATA_HUB_ENV, cat.data_hub().in_task.to_string_lossy()),
        );

        let mounts = if platform.is_container() {
            let mut m = cat.bind_mounts(&self.cfg.external_dirs, hub_readonly);
            m.extend(spec.mounts.iter().cloned());
            m
        } else {
            Vec::new()
        };
        let name = (platform == Platform::Docker).then(|| {
            let tag = cat
                .dir()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| label.to_string());
            container::container_name(&tag)
        });
        let line = container::command_line(
            platform,
            image,
            name.as_deref(),
            &args,
            &mounts,
            &env,
            &self.cfg.container,
        );

        let stdout = std::fs::File::create(cat.stdout_file())?;
        let stderr = std::fs::File::create(cat.stderr_file())?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&line)
            .current_dir(cat.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if !platform.is_container() {
            cmd.envs(env.resolved());
        }
        #[cfg(target_family = "unix")]
        cmd.process_group(0);

        trace!(target: "pilot.exec.proc", task = %label, %line, "spawn");
        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("sh -c {line}: {e}")))?;
        let mut guard = GroupGuard::new(child.id()).with_container(name.clone());

        let status = match spec.timeout() {
            None => child.wait().await,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    let elapsed = started.elapsed();
                    warn!(target: "pilot.exec.proc", task = %label, ?limit, "timed out; killing");
                    if let Some(name) = &name {
                        container::kill_container(name).await;
                    }
                    if let Err(e) = kill_graceful(&mut child, KILL_GRACE).await {
                        debug!(target: "pilot.exec.proc", task = %label, error = %e, "kill failed");
                    }
                    guard.disarm();
                    return Err(ExecError::Timeout { elapsed });
                }
            },
        };
        guard.disarm();
        let status = status?;

        debug!(
            target: "pilot.exec.proc",
            task = %label,
            %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exited"
        );
        if status.success() {
            return Ok(());
        }

        let captured = fs::read(cat.stderr_file()).await.unwrap_or_default();
        let diagnostic = extract_error(&captured);
        Err(match status.code() {
            Some(code) => ExecError::NonZeroExit { code, diagnostic },
            None => ExecError::KilledBySignal { diagnostic },
        })
    }

    async fn after(&self, cat: &DirectoryCatalog, label: &str, failed: bool) {
        if failed || self.cfg.dump_output {
            let out = cat.stdout_file();
            match self.cfg.stdout_dump_stream() {
                DumpStream::Stdout => {
                    dump_file(&out, label, "stdout", &mut tokio::io::stdout()).await
                }
                DumpStream::Stderr => {
                    dump_file(&out, label, "stdout", &mut tokio::io::stderr()).await
                }
            }
            dump_file(&cat.stderr_file(), label, "stderr", &mut tokio::io::stderr()).await;
        }
        if failed || self.cfg.keep_files {
            return;
        }
        if let Err(e) = cat.remove().await {
            warn!(target: "pilot.exec.proc", dir = %cat.dir().display(), error = %e, "could not remove task directory");
        }
    }
}

fn resolved<'a>(slot: &'a OnceLock<String>, spec: &'a RunSpec) -> &'a str {
    slot.get().map(String::as_str).unwrap_or(&spec.image)
}

async fn prepare_spec(
    cfg: &ExecConfig,
    slot: &OnceLock<String>,
    spec: &RunSpec,
) -> Result<(), TaskError> {
    if slot.get().is_some() {
        return Ok(());
    }
    if cfg.platform.is_container() && spec.image.trim().is_empty() {
        return Err(TaskError::Setup(format!(
            "{} platform needs an image",
            cfg.platform
        )));
    }
    let image = container::prepare_image(cfg.platform, &spec.image, &cfg.container).await?;
    let _ = slot.set(image);
    Ok(())
}

async fn dump_file<W>(path: &Path, label: &str, stream: &str, sink: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let body = match fs::read(path).await {
        Ok(b) => b,
        Err(e) => {
            debug!(target: "pilot.exec.proc", path = %path.display(), error = %e, "nothing to dump");
            return;
        }
    };
    let header = format!("----- {stream} of {label} ({}) -----\n", path.display());
    let footer = format!("----- end of {stream} of {label} -----\n");
    let res = async {
        sink.write_all(header.as_bytes()).await?;
        sink.write_all(&body).await?;
        if !body.ends_with(b"\n") {
            sink.write_all(b"\n").await?;
        }
        sink.write_all(footer.as_bytes()).await?;
        sink.flush().await
    }
    .await;
    if let Err(e) = res {
        debug!(target: "pilot.exec.proc", error = %e, "dump failed");
    }
}

#[async_trait]
impl Runner for ProcRunner {
    fn name(&self) -> &'static str {
        "proc"
    }

    async fn prepare(&self) -> Result<(), TaskError> {
        if self.task.args.trim().is_empty() && !self.cfg.platform.is_container() {
            return Err(TaskError::Setup("task command is empty".into()));
        }
        self.work.create().await.map_err(|e| {
            TaskError::Setup(format!(
                "working directory {}: {e}",
                self.work.root().display()
            ))
        })?;

        prepare_spec(&self.cfg, &self.task_image, &self.task).await?;
        if let Some(init) = &self.init {
            prepare_spec(&self.cfg, &self.init_image, init).await?;
        }
        info!(
            target: "pilot.exec.proc",
            platform = %self.cfg.platform,
            root = %self.work.root().display(),
            "runtime ready"
        );
        Ok(())
    }

    async fn init(&self) -> Result<(), TaskError> {
        let Some(spec) = &self.init else {
            return Ok(());
        };
        let cat = self
            .work
            .init_catalog()
            .await
            .map_err(|e| TaskError::Setup(format!("init directory: {e}")))?;

        // The init step has no payload; file placeholders point into its own task-io dir.
        let infile = cat.io_file("init-infile");
        let outfile = cat.io_file("init-outfile");
        let ph = Placeholders {
            infile: &infile.in_task,
            outfile: &outfile.in_task,
            data_hub: &cat.data_hub().in_task,
        };

        info!(target: "pilot.exec.proc", "running init step");
        let image = resolved(&self.init_image, spec);
        let result = self.invoke("init", spec, image, &cat, &ph, false).await;
        self.after(&cat, "init", result.is_err()).await;
        result.map_err(TaskError::from)
    }

    async fn run(&self, id: &TaskId, input: Payload) -> Result<Payload, TaskError> {
        self.execute(id, input).await.map_err(TaskError::from)
    }

    async fn finish(&self, failed: bool) {
        if self.cfg.keep_files {
            return;
        }
        if self.work.cleanup().await {
            debug!(target: "pilot.exec.proc", failed, "working directory removed");
        }
    }
}
