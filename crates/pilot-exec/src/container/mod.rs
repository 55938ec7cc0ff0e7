//! Container runtime plumbing: image preparation and `sh -c` command-line assembly.
//!
//! The pilot never talks to a container daemon directly; it shells out to the `docker` or `apptainer`
//! CLI exactly like an operator would.

use std::{
    borrow::Cow,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use pilot_model::{BindMount, Platform, TaskEnv};
use shell_escape::escape;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    error::{ExecError, ExecResult},
    logparse::extract_error,
};

/// Env var under which the task finds the shared data hub.
pub const DATA_HUB_ENV: &str = "PILOT_DATA_HUB_DIR";

/// Bound on one `docker kill`.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

const INFILE_TOKENS: [&str; 2] = ["{{INFILE}}", "{{IN_FILE}}"];
const OUTFILE_TOKENS: [&str; 2] = ["{{OUTFILE}}", "{{OUT_FILE}}"];
const DATA_HUB_TOKENS: [&str; 2] = ["{{DATA_HUB}}", "{{DATAHUB}}"];

/// Runtime-specific knobs shared by every invocation.
#[derive(Clone, Debug, Default)]
pub struct ContainerConfig {
    /// `--shm-size` for docker.
    pub shm_size: Option<String>,
    /// Skip `docker pull` (image already present, e.g. in CI).
    pub skip_pull: bool,
    /// Where apptainer sandboxes are built. Defaults to the current directory.
    pub apptainer_build_dir: Option<PathBuf>,
    /// Refuse to build: the apptainer image must already be a sandbox directory.
    pub apptainer_require_dir: bool,
    /// Pass `--debug` to apptainer.
    pub debug: bool,
}

pub fn quote(s: &str) -> String {
    escape(Cow::Borrowed(s)).into_owned()
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Paths (as seen by the task) a template may refer to.
#[derive(Clone, Copy, Debug)]
pub struct Placeholders<'a> {
    pub infile: &'a Path,
    pub outfile: &'a Path,
    pub data_hub: &'a Path,
}

/// Replace every placeholder token in `template` with its shell-quoted path.
pub fn substitute(template: &str, ph: &Placeholders<'_>) -> String {
    let mut out = template.to_string();
    let pairs = [
        (INFILE_TOKENS, quote_path(ph.infile)),
        (OUTFILE_TOKENS, quote_path(ph.outfile)),
        (DATA_HUB_TOKENS, quote_path(ph.data_hub)),
    ];
    for (tokens, value) in &pairs {
        for token in tokens {
            out = out.replace(token, value);
        }
    }
    out
}

/// `--mount type=bind,source=S,target=T[,readonly]`
pub fn mount_option(m: &BindMount) -> String {
    let mut spec = format!(
        "type=bind,source={},target={}",
        m.source.display(),
        m.target.display()
    );
    if m.readonly {
        spec.push_str(",readonly");
    }
    format!("--mount {}", quote(&spec))
}

/// One `--env K=V` per resolved variable.
pub fn env_options(env: &TaskEnv) -> Vec<String> {
    env.resolved()
        .into_iter()
        .map(|(k, v)| format!("--env {}", quote(&format!("{k}={v}"))))
        .collect()
}

/// Docker container name for one execution, unique within this pilot process.
///
/// Killing the `docker run` client does not stop the container; the daemon does, by this name.
pub fn container_name(tag: &str) -> String {
    let tag: String = tag
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '_',
        })
        .collect();
    format!("pilot-{}-{tag}", std::process::id())
}

/// `docker kill <name>`, detached from the pilot's stdio.
pub fn kill_command(name: &str) -> Command {
    let mut cmd = Command::new("docker");
    cmd.arg("kill")
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    cmd
}

/// Stop a named task container. A container that already exited is not an error.
pub async fn kill_container(name: &str) {
    match tokio::time::timeout(KILL_TIMEOUT, kill_command(name).output()).await {
        Ok(Ok(out)) if out.status.success() => {
            debug!(target: "pilot.exec.container", container = name, "container killed");
        }
        Ok(Ok(out)) => debug!(
            target: "pilot.exec.container",
            container = name,
            status = %out.status,
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "docker kill had nothing to stop"
        ),
        Ok(Err(e)) => warn!(target: "pilot.exec.container", container = name, error = %e, "docker kill failed"),
        Err(_) => warn!(target: "pilot.exec.container", container = name, "docker kill timed out"),
    }
}

/// The command line handed to `sh -c`.
///
/// `args` must already be substituted. For [`Platform::Process`] it is returned untouched and
/// `mounts`/`env` are ignored (the caller passes env directly to the child). `name` is only used by
/// docker.
pub fn command_line(
    platform: Platform,
    image: &str,
    name: Option<&str>,
    args: &str,
    mounts: &[BindMount],
    env: &TaskEnv,
    cfg: &ContainerConfig,
) -> String {
    let mut parts: Vec<String> = match platform {
        Platform::Process => return args.to_string(),
        Platform::Docker => {
            let mut p = vec!["docker run --rm".to_string()];
            if let Some(name) = name {
                p.push(format!("--name {}", quote(name)));
            }
            if let Some(shm) = cfg.shm_size.as_deref().filter(|s| !s.is_empty()) {
                p.push(format!("--shm-size={}", quote(shm)));
            }
            p
        }
        Platform::Apptainer => {
            let mut p = vec!["apptainer".to_string()];
            if cfg.debug {
                p.push("--debug".into());
            }
            p.push("run --containall --no-eval".into());
            p
        }
    };
    parts.extend(mounts.iter().map(mount_option));
    parts.extend(env_options(env));
    parts.push(quote(image));
    if !args.trim().is_empty() {
        parts.push(args.to_string());
    }
    parts.join(" ")
}

/// Make `image` runnable and return the reference to run it by. Idempotent.
pub async fn prepare_image(
    platform: Platform,
    image: &str,
    cfg: &ContainerConfig,
) -> ExecResult<String> {
    match platform {
        Platform::Process => Ok(image.to_string()),
        Platform::Docker => {
            if cfg.skip_pull {
                debug!(target: "pilot.exec.container", %image, "skipping docker pull");
            } else {
                info!(target: "pilot.exec.container", %image, "pulling image");
                let mut cmd = Command::new("docker");
                cmd.arg("pull").arg(image);
                run_checked(cmd, "docker pull").await?;
            }
            Ok(image.to_string())
        }
        Platform::Apptainer => prepare_sandbox(image, cfg).await,
    }
}

async fn prepare_sandbox(image: &str, cfg: &ContainerConfig) -> ExecResult<String> {
    if Path::new(image).is_dir() {
        debug!(target: "pilot.exec.container", %image, "using existing sandbox directory");
        return Ok(image.to_string());
    }
    if cfg.apptainer_require_dir {
        return Err(ExecError::Setup(format!(
            "apptainer image must be a present sandbox directory: {image}"
        )));
    }

    let source = apptainer_source(image);
    let build_dir = cfg
        .apptainer_build_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let name = sandbox_name(&source);
    let sandbox = build_dir.join(&name);
    if sandbox.is_dir() {
        debug!(target: "pilot.exec.container", sandbox = %sandbox.display(), "sandbox already built");
        return Ok(sandbox.to_string_lossy().into_owned());
    }

    tokio::fs::create_dir_all(&build_dir).await?;
    info!(target: "pilot.exec.container", %source, sandbox = %sandbox.display(), "building apptainer sandbox");
    let mut cmd = Command::new("apptainer");
    cmd.current_dir(&build_dir)
        .args(["build", "--fix-perms", "--sandbox"])
        .arg(&name)
        .arg(&source);
    run_checked(cmd, "apptainer build").await?;
    Ok(sandbox.to_string_lossy().into_owned())
}

/// Bare registry names are pulled from docker hub.
pub fn apptainer_source(image: &str) -> String {
    if image.contains("://") || image.contains('.') {
        image.to_string()
    } else {
        format!("docker://{image}")
    }
}

/// Directory name for a sandbox built from `source`.
pub fn sandbox_name(source: &str) -> String {
    source.replace("://", "_").replace('/', "_")
}

async fn run_checked(mut cmd: Command, what: &str) -> ExecResult<()> {
    let out = cmd
        .output()
        .await
        .map_err(|e| ExecError::Spawn(format!("{what}: {e}")))?;
    if out.status.success() {
        return Ok(());
    }
    Err(ExecError::Setup(format!(
        "{what} failed ({}): {}",
        out.status,
        extract_error(&out.stderr)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ph() -> Placeholders<'static> {
        Placeholders {
            infile: Path::new("/pilot-data/task-io/infile-1.txt"),
            outfile: Path::new("/pilot-data/task-io/out file.txt"),
            data_hub: Path::new("/pilot-data/data-hub"),
        }
    }

    #[test]
    fn substitutes_every_alias() {
        let got = substitute(
            "cat {{INFILE}} {{IN_FILE}} > {{OUTFILE}}; ls {{DATA_HUB}} {{DATAHUB}} {{OUT_FILE}}",
            &ph(),
        );
        assert_eq!(
            got,
            "cat /pilot-data/task-io/infile-1.txt /pilot-data/task-io/infile-1.txt > '/pilot-data/task-io/out file.txt'; \
             ls /pilot-data/data-hub /pilot-data/data-hub '/pilot-data/task-io/out file.txt'"
        );
    }

    #[test]
    fn unknown_tokens_are_left_alone() {
        assert_eq!(substitute("echo {{FOO}}", &ph()), "echo {{FOO}}");
    }

    #[test]
    fn docker_command_line() {
        let mounts = vec![
            BindMount::new("/host/hub", "/pilot-data/data-hub").readonly(),
            BindMount::new("/host/io", "/pilot-data/task-io"),
        ];
        let env = TaskEnv::new().with("A", "1").with("A", "2");
        let cfg = ContainerConfig {
            shm_size: Some("6gb".into()),
            ..Default::default()
        };
        let line = command_line(
            Platform::Docker,
            "alpine",
            Some("pilot-7-t1"),
            "echo hi",
            &mounts,
            &env,
            &cfg,
        );
        assert_eq!(
            line,
            "docker run --rm --name pilot-7-t1 --shm-size=6gb \
             --mount type=bind,source=/host/hub,target=/pilot-data/data-hub,readonly \
             --mount type=bind,source=/host/io,target=/pilot-data/task-io \
             --env A=2 alpine echo hi"
        );
    }

    #[test]
    fn apptainer_command_line() {
        let cfg = ContainerConfig {
            debug: true,
            ..Default::default()
        };
        let line = command_line(
            Platform::Apptainer,
            "/sandboxes/img",
            None,
            "",
            &[],
            &TaskEnv::new(),
            &cfg,
        );
        assert_eq!(line, "apptainer --debug run --containall --no-eval /sandboxes/img");
    }

    #[test]
    fn process_command_line_is_the_template() {
        let line = command_line(
            Platform::Process,
            "",
            Some("ignored"),
            "echo hi",
            &[BindMount::new("/a", "/b")],
            &TaskEnv::new().with("X", "y"),
            &ContainerConfig::default(),
        );
        assert_eq!(line, "echo hi");
    }

    #[test]
    fn container_names_are_docker_safe() {
        let name = container_name("abc:1/x-2");
        assert_eq!(name, format!("pilot-{}-abc_1_x-2", std::process::id()));
        assert_ne!(container_name("t1"), container_name("t1-2"));
    }

    #[test]
    fn kill_targets_the_named_container() {
        let cmd = kill_command("pilot-7-t1");
        let inner = cmd.as_std();
        assert_eq!(inner.get_program(), "docker");
        let args: Vec<_> = inner.get_args().collect();
        assert_eq!(args, ["kill", "pilot-7-t1"]);
    }

    #[test]
    fn env_values_are_quoted() {
        let env = TaskEnv::new().with("MSG", "hello world");
        assert_eq!(env_options(&env), vec!["--env 'MSG=hello world'".to_string()]);
    }

    #[test]
    fn apptainer_image_names() {
        assert_eq!(apptainer_source("alpine:3"), "docker://alpine:3");
        assert_eq!(apptainer_source("docker://alpine:3"), "docker://alpine:3");
        assert_eq!(apptainer_source("img.sif"), "img.sif");
        assert_eq!(sandbox_name("docker://icecube/skymap:4"), "docker_icecube_skymap:4");
    }

    #[tokio::test]
    async fn existing_sandbox_is_used_as_is() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().to_string_lossy().into_owned();
        let got = prepare_image(Platform::Apptainer, &image, &ContainerConfig::default())
            .await
            .unwrap();
        assert_eq!(got, image);
    }

    #[tokio::test]
    async fn missing_sandbox_is_an_error_when_building_is_disallowed() {
        let cfg = ContainerConfig {
            apptainer_require_dir: true,
            ..Default::default()
        };
        let err = prepare_image(Platform::Apptainer, "/does/not/exist", &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Setup(_)));
    }

    #[tokio::test]
    async fn skip_pull_does_not_shell_out() {
        let cfg = ContainerConfig {
            skip_pull: true,
            ..Default::default()
        };
        let got = prepare_image(Platform::Docker, "alpine:3", &cfg).await.unwrap();
        assert_eq!(got, "alpine:3");
    }
}
