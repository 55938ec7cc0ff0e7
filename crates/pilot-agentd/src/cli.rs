use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{ArgAction, Parser};
use pilot_core::PilotConfig;
use pilot_exec::{ExecConfig, container::ContainerConfig};
use pilot_model::{FileType, Platform, RunSpec, TaskEnv};
use pilot_observe::{LoggerConfig, LoggerFormat};

/// Consume tasks from a queue, run each as a subprocess or container, publish the results.
///
/// Every flag falls back to a `PILOT_*` environment variable.
#[derive(Parser, Debug)]
#[command(name = "pilot", version)]
pub struct Cli {
    // === Task ===
    /// Container image of the task (ignored on the process platform)
    #[arg(long, env = "PILOT_TASK_IMAGE", default_value = "")]
    pub task_image: String,

    /// Task argument template; {{INFILE}}, {{OUTFILE}} and {{DATA_HUB}} are substituted
    #[arg(long, env = "PILOT_TASK_ARGS", default_value = "")]
    pub task_args: String,

    /// JSON object of env vars for the task, e.g. '{"N": 3}'
    #[arg(long, env = "PILOT_TASK_ENV", default_value = "")]
    pub task_env: String,

    /// Per-task time limit in seconds; unbounded when absent
    #[arg(long, env = "PILOT_TASK_TIMEOUT", value_parser = parse_secs)]
    pub task_timeout: Option<Duration>,

    // === Init step ===
    #[arg(long, env = "PILOT_INIT_IMAGE", default_value = "")]
    pub init_image: String,

    #[arg(long, env = "PILOT_INIT_ARGS", default_value = "")]
    pub init_args: String,

    #[arg(long, env = "PILOT_INIT_ENV", default_value = "")]
    pub init_env: String,

    #[arg(long, env = "PILOT_INIT_TIMEOUT", value_parser = parse_secs)]
    pub init_timeout: Option<Duration>,

    // === Files ===
    /// txt | json | bin
    #[arg(long, env = "PILOT_INFILE_TYPE", default_value = "txt")]
    pub infile_type: FileType,

    /// txt | json | bin
    #[arg(long, env = "PILOT_OUTFILE_TYPE", default_value = "txt")]
    pub outfile_type: FileType,

    /// Root of the per-run working directories
    #[arg(long, env = "PILOT_WORK_DIR", default_value = "./pilot-data")]
    pub work_dir: PathBuf,

    /// Keep every task directory, even after success
    #[arg(long, env = "PILOT_KEEP_ALL_TASK_FILES")]
    pub keep_all_task_files: bool,

    /// Copy each task's stdout/stderr to the pilot's own; task stdout goes to stderr unless --results is set
    #[arg(long, env = "PILOT_DUMP_TASK_OUTPUT")]
    pub dump_task_output: bool,

    // === Runtime ===
    /// process | docker | apptainer
    #[arg(long, env = "PILOT_PLATFORM", default_value = "process")]
    pub platform: Platform,

    /// Host directories bind-mounted read-only into every container
    #[arg(long, env = "PILOT_EXTERNAL_DIRECTORIES", value_delimiter = ',')]
    pub external_dirs: Vec<PathBuf>,

    #[arg(long, env = "PILOT_DOCKER_SHM_SIZE")]
    pub docker_shm_size: Option<String>,

    /// Assume docker images are present
    #[arg(long, env = "PILOT_CI_SKIP_DOCKER_PULL")]
    pub skip_docker_pull: bool,

    #[arg(long, env = "PILOT_APPTAINER_BUILD_DIR")]
    pub apptainer_build_dir: Option<PathBuf>,

    /// Fail instead of building an apptainer sandbox
    #[arg(long, env = "PILOT_APPTAINER_IMAGE_DIRECTORY_MUST_BE_PRESENT")]
    pub apptainer_require_dir: bool,

    #[arg(long, env = "PILOT_CONTAINER_DEBUG")]
    pub container_debug: bool,

    // === Queues ===
    #[arg(long, env = "PILOT_QUEUE_INCOMING", default_value = "tasks")]
    pub queue_incoming: String,

    #[arg(long, env = "PILOT_QUEUE_OUTGOING", default_value = "results")]
    pub queue_outgoing: String,

    #[arg(long, env = "PILOT_PREFETCH", default_value_t = 1)]
    pub prefetch: u16,

    #[arg(long, env = "PILOT_MAX_CONCURRENT_TASKS", default_value_t = 1)]
    pub max_concurrent_tasks: usize,

    /// Idle seconds after which the pilot stops listening
    #[arg(long, env = "PILOT_TIMEOUT_INCOMING", default_value = "60", value_parser = parse_secs)]
    pub timeout_incoming: Duration,

    /// Idle budget before the first message; defaults to --timeout-incoming
    #[arg(long, env = "PILOT_TIMEOUT_WAIT_FOR_FIRST_MESSAGE", value_parser = parse_secs)]
    pub timeout_first_message: Option<Duration>,

    /// Seconds allowed for publishing one result
    #[arg(long, env = "PILOT_TIMEOUT_OUTGOING", default_value = "1800", value_parser = parse_secs)]
    pub timeout_outgoing: Duration,

    /// Seconds to wait before exiting after a failed run
    #[arg(long, env = "PILOT_QUARANTINE_TIME", default_value = "0", value_parser = parse_secs)]
    pub quarantine_time: Duration,

    #[arg(
        long,
        env = "PILOT_STOP_LISTENING_ON_TASK_ERROR",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub stop_listening_on_task_error: bool,

    /// Seconds in-flight tasks get to finish after Ctrl-C
    #[arg(long, env = "PILOT_SHUTDOWN_GRACE", default_value = "10", value_parser = parse_secs)]
    pub shutdown_grace: Duration,

    // === Local harness ===
    /// JSON-lines file of task payloads to enqueue
    #[arg(long, env = "PILOT_SEED")]
    pub seed: Option<PathBuf>,

    /// Where published results go as JSON lines; stdout when absent
    #[arg(long, env = "PILOT_RESULTS")]
    pub results: Option<PathBuf>,

    /// Write prometheus metrics (text format) here when the run ends
    #[arg(long, env = "PILOT_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    // === Logging ===
    /// Level or filter directive, e.g. `info` or `warn,pilot.exec=debug`
    #[arg(long, env = "PILOT_LOG", default_value = "info")]
    pub log: String,

    /// text | json | journald
    #[arg(long, env = "PILOT_LOG_FORMAT", default_value = "text")]
    pub log_format: LoggerFormat,
}

fn parse_secs(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("'{raw}' is not a number of seconds: {e}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("'{raw}' must be a non-negative number of seconds"));
    }
    Ok(Duration::from_secs_f64(secs))
}

impl Cli {
    pub fn logger(&self) -> LoggerConfig {
        LoggerConfig::new(self.log_format, self.log.clone())
    }

    pub fn pilot_config(&self) -> PilotConfig {
        PilotConfig::new(&self.queue_incoming, &self.queue_outgoing)
            .with_prefetch(self.prefetch)
            .with_max_concurrency(self.max_concurrent_tasks)
            .with_timeout_incoming(self.timeout_incoming)
            .with_timeout_first_message(self.timeout_first_message)
            .with_timeout_outgoing(self.timeout_outgoing)
            .with_quarantine(self.quarantine_time)
            .with_stop_on_first_error(self.stop_listening_on_task_error)
            .with_shutdown_grace(self.shutdown_grace)
    }

    pub fn exec_config(&self) -> ExecConfig {
        let container = ContainerConfig {
            shm_size: self.docker_shm_size.clone(),
            skip_pull: self.skip_docker_pull,
            apptainer_build_dir: self.apptainer_build_dir.clone(),
            apptainer_require_dir: self.apptainer_require_dir,
            debug: self.container_debug,
        };
        let mut cfg = ExecConfig::new(&self.work_dir)
            .with_platform(self.platform)
            .with_file_types(self.infile_type, self.outfile_type)
            .with_keep_files(self.keep_all_task_files)
            .with_dump_output(self.dump_task_output)
            .with_dump_to_stderr(self.results.is_none())
            .with_container(container);
        cfg.external_dirs = self.external_dirs.clone();
        cfg
    }

    pub fn task_spec(&self) -> anyhow::Result<RunSpec> {
        let env = TaskEnv::from_json(&self.task_env).context("--task-env")?;
        Ok(RunSpec::new(&self.task_image, &self.task_args)
            .with_timeout(self.task_timeout)
            .with_env(env))
    }

    /// `None` when no init step is configured.
    pub fn init_spec(&self) -> anyhow::Result<Option<RunSpec>> {
        let env = TaskEnv::from_json(&self.init_env).context("--init-env")?;
        let spec = RunSpec::new(&self.init_image, &self.init_args)
            .with_timeout(self.init_timeout)
            .with_env(env);
        Ok((!spec.is_empty()).then_some(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_exec::DumpStream;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["pilot"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_pilot_config() {
        let cli = parse(&["--task-args", "true"]);
        let cfg = cli.pilot_config();
        let reference = PilotConfig::new("tasks", "results");
        assert_eq!(cfg.timeout_incoming, reference.timeout_incoming);
        assert_eq!(cfg.timeout_outgoing, reference.timeout_outgoing);
        assert_eq!(cfg.prefetch, 1);
        assert_eq!(cfg.max_concurrency, 1);
        assert!(cfg.stop_on_first_error);
        assert!(cfg.quarantine.is_zero());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_typed_flags() {
        let cli = parse(&[
            "--platform",
            "docker",
            "--task-image",
            "alpine",
            "--infile-type",
            ".json",
            "--task-timeout",
            "2.5",
            "--stop-listening-on-task-error",
            "false",
            "--external-dirs",
            "/cvmfs,/data",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.platform, Platform::Docker);
        assert_eq!(cli.infile_type, FileType::Json);
        assert_eq!(cli.task_timeout, Some(Duration::from_millis(2500)));
        assert!(!cli.stop_listening_on_task_error);
        assert_eq!(
            cli.exec_config().external_dirs,
            vec![PathBuf::from("/cvmfs"), PathBuf::from("/data")]
        );
        assert_eq!(cli.logger().format, LoggerFormat::Json);
    }

    #[test]
    fn task_stdout_stays_out_of_the_results_stream() {
        let cli = parse(&["--task-args", "true"]);
        assert_eq!(cli.exec_config().stdout_dump_stream(), DumpStream::Stderr);

        let cli = parse(&["--task-args", "true", "--results", "out.jsonl"]);
        assert_eq!(cli.exec_config().stdout_dump_stream(), DumpStream::Stdout);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Cli::try_parse_from(["pilot", "--platform", "vm"]).is_err());
        assert!(Cli::try_parse_from(["pilot", "--task-timeout", "-1"]).is_err());
        assert!(Cli::try_parse_from(["pilot", "--outfile-type", "pkl"]).is_err());
    }

    #[test]
    fn env_json_is_validated() {
        let cli = parse(&["--task-args", "true", "--task-env", r#"{"N": 3, "S": "x"}"#]);
        let spec = cli.task_spec().unwrap();
        assert_eq!(spec.env.get("N"), Some("3"));

        let cli = parse(&["--task-args", "true", "--task-env", r#"{"N": [1]}"#]);
        assert!(cli.task_spec().is_err());
    }

    #[test]
    fn init_is_optional() {
        assert!(parse(&[]).init_spec().unwrap().is_none());
        let spec = parse(&["--init-args", "echo hi"]).init_spec().unwrap().unwrap();
        assert_eq!(spec.args, "echo hi");
    }
}
