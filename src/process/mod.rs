use std::ffi::OsString;
use std::io::{self, BufRead, BufReader};
use std::path::{self, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::env;
use crate::error::{BootstrapError, Result};
use crate::loader::{CodeContext, EntryPoint};
use crate::manifest::Manifest;

/// How long a spawned child is watched before the parent lets go.
pub const SUPERVISION_WINDOW: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hidden flag a re-invoked shell receives with the artifact locations.
pub const MODULE_PATH_FLAG: &str = "--module-path";
/// Hidden flag carrying the manifest's launch parameters to a re-invoked shell.
pub const APP_PARAMETERS_FLAG: &str = "--app-parameters";

/// Facts about the running shell that the launch decision depends on.
#[derive(Clone, Debug)]
pub struct LaunchEnvironment {
    /// The current process may host applications that implement the hosted
    /// contract. Cleared by `--external`.
    pub hosting_shell: bool,
    /// Command-line arguments as received, without the program name.
    pub raw_args: Vec<String>,
    pub current_exe: PathBuf,
    pub host_tag: &'static str,
}

impl LaunchEnvironment {
    pub fn detect(raw_args: Vec<String>, hosting_shell: bool) -> Self {
        let current_exe = std::env::current_exe().unwrap_or_else(|err| {
            warn!("launch: unable to locate current executable ({err}); using argv[0]");
            PathBuf::from(std::env::args().next().unwrap_or_default())
        });
        Self {
            hosting_shell,
            raw_args,
            current_exe,
            host_tag: env::host_platform_tag(),
        }
    }
}

/// The one way the application is going to start.
#[derive(Clone, Debug)]
pub enum LaunchStrategy {
    /// Call the entry point on this process's main thread, with the manifest's
    /// parameters appended to the original arguments.
    InProcess {
        entry: EntryPoint,
        parameters: Vec<String>,
    },
    /// Run the manifest's command from the cache directory. `command_line` is
    /// the literal form, kept for logging.
    ExternalCommand {
        program: PathBuf,
        args: Vec<String>,
        command_line: String,
    },
    /// Re-invoke this executable as a hosting shell over the artifact locations.
    ExternalModulePath {
        program: PathBuf,
        args: Vec<OsString>,
    },
}

fn absolute_cache_dir(cache_dir: &Path) -> PathBuf {
    path::absolute(cache_dir).unwrap_or_else(|_| cache_dir.to_path_buf())
}

/// `<abs cache dir><separator><command>` followed by ` <parameters>` when present.
pub fn command_line(cache_dir: &Path, command: &str, parameters: Option<&str>) -> String {
    let base = absolute_cache_dir(cache_dir);
    let mut line = format!("{}{}{}", base.display(), path::MAIN_SEPARATOR, command);
    if let Some(parameters) = parameters {
        line.push(' ');
        line.push_str(parameters);
    }
    line
}

/// Split launch parameters with shell-word rules. Only the parameters are
/// split; the program path is never reparsed.
pub fn split_parameters(parameters: Option<&str>) -> Result<Vec<String>> {
    let Some(parameters) = parameters else {
        return Ok(Vec::new());
    };
    shell_words::split(parameters).map_err(|e| BootstrapError::Spawn {
        program: parameters.to_owned(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

/// Arguments for re-invoking the shell: the module path, the original
/// arguments, then the entry point name last.
pub fn module_path_args(
    manifest: &Manifest,
    cache_dir: &Path,
    env: &LaunchEnvironment,
    entry: &str,
) -> Result<Vec<OsString>> {
    let locations = manifest.artifact_paths_for(cache_dir, env.host_tag);
    let joined = std::env::join_paths(&locations).map_err(|e| BootstrapError::Spawn {
        program: env.current_exe.display().to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;

    let mut args = Vec::with_capacity(env.raw_args.len() + 4);
    args.push(OsString::from(MODULE_PATH_FLAG));
    args.push(joined);
    if let Some(parameters) = manifest.parameters() {
        args.push(OsString::from(format!("{APP_PARAMETERS_FLAG}={parameters}")));
    }
    args.extend(env.raw_args.iter().map(OsString::from));
    args.push(OsString::from(entry));
    Ok(args)
}

impl LaunchStrategy {
    /// Evaluate the launch decision once, in priority order.
    pub fn decide(
        manifest: &Manifest,
        cache_dir: &Path,
        context: &CodeContext,
        env: &LaunchEnvironment,
    ) -> Result<Self> {
        let resolved = manifest
            .entry_point()
            .map(|name| context.resolve_entry(name));
        Self::choose(manifest, cache_dir, resolved, env)
    }

    fn choose(
        manifest: &Manifest,
        cache_dir: &Path,
        resolved: Option<Result<EntryPoint>>,
        env: &LaunchEnvironment,
    ) -> Result<Self> {
        let command = manifest.launch_command();
        let entry = match resolved {
            Some(Ok(entry)) => Some(entry),
            // A declared command does not need the entry point.
            Some(Err(err)) if command.is_some() => {
                debug!("launch: entry point unresolved, using command instead ({err})");
                None
            }
            Some(Err(err)) => return Err(err),
            None => None,
        };

        if let Some(entry) = &entry
            && env.hosting_shell
            && entry.hosted
        {
            return Ok(LaunchStrategy::InProcess {
                entry: entry.clone(),
                parameters: split_parameters(manifest.parameters())?,
            });
        }
        if let Some(command) = command {
            return Ok(LaunchStrategy::ExternalCommand {
                program: absolute_cache_dir(cache_dir).join(command),
                args: split_parameters(manifest.parameters())?,
                command_line: command_line(cache_dir, command, manifest.parameters()),
            });
        }
        if let Some(entry) = entry {
            return Ok(LaunchStrategy::ExternalModulePath {
                program: env.current_exe.clone(),
                args: module_path_args(manifest, cache_dir, env, &entry.name)?,
            });
        }
        Err(BootstrapError::Configuration)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LaunchStrategy::InProcess { .. } => "in-process",
            LaunchStrategy::ExternalCommand { .. } => "external command",
            LaunchStrategy::ExternalModulePath { .. } => "external module path",
        }
    }

    /// Build the OS command for external strategies.
    pub fn prepare(&self, cache_dir: &Path) -> Result<Option<Command>> {
        match self {
            LaunchStrategy::InProcess { .. } => Ok(None),
            LaunchStrategy::ExternalCommand {
                program,
                args,
                command_line,
            } => {
                debug!("launch: running {command_line}");
                let mut cmd = Command::new(program);
                cmd.args(args).current_dir(cache_dir);
                Ok(Some(cmd))
            }
            LaunchStrategy::ExternalModulePath { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(Some(cmd))
            }
        }
    }
}

/// How control left the bootstrapper.
pub enum LaunchOutcome {
    /// The application runs on this process's main thread once bootstrap returns.
    InProcess(HostedApp),
    /// The child outlived the supervision window.
    HandedOff { pid: u32 },
    /// The child exited inside the supervision window.
    ChildExited { code: Option<i32> },
}

/// An entry point together with the context that keeps its library loaded.
pub struct HostedApp {
    context: CodeContext,
    entry: EntryPoint,
    parameters: Vec<String>,
}

impl HostedApp {
    pub fn new(context: CodeContext, entry: EntryPoint, parameters: Vec<String>) -> Self {
        Self {
            context,
            entry,
            parameters,
        }
    }

    pub fn entry(&self) -> &EntryPoint {
        &self.entry
    }

    /// argv as the application sees it: entry name, the original arguments,
    /// then the manifest's parameters.
    pub fn argv(&self, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + args.len() + self.parameters.len());
        argv.push(self.entry.name.clone());
        argv.extend_from_slice(args);
        argv.extend_from_slice(&self.parameters);
        argv
    }

    pub fn run(self, args: &[String]) -> i32 {
        let argv = self.argv(args);
        self.context.invoke(&self.entry, &argv)
    }
}

/// Spawn `cmd` and watch it for `window`, draining its stderr into the log.
pub async fn spawn_and_supervise(mut cmd: Command, window: Duration) -> Result<LaunchOutcome> {
    let program = format!("{:?}", cmd.get_program());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|source| BootstrapError::Spawn { program, source })?;
    info!("launch: process {} started", child.id());
    drain_stderr(&mut child);
    Ok(supervise(child, window).await)
}

fn drain_stderr(child: &mut Child) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    let pid = child.id();
    let spawned = thread::Builder::new()
        .name("child-stderr".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => warn!("child {pid}: {line}"),
                    Err(_) => break,
                }
            }
        });
    if let Err(err) = spawned {
        warn!("launch: unable to drain child stderr: {err}");
    }
}

async fn supervise(mut child: Child, window: Duration) -> LaunchOutcome {
    let deadline = Instant::now() + window;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!("launch: child exited early with {status}");
                return LaunchOutcome::ChildExited {
                    code: status.code(),
                };
            }
            Ok(None) if Instant::now() >= deadline => {
                info!("launch: child {} still running; handing off", child.id());
                return LaunchOutcome::HandedOff { pid: child.id() };
            }
            Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
            Err(err) => {
                warn!("launch: unable to poll child: {err}");
                return LaunchOutcome::HandedOff { pid: child.id() };
            }
        }
    }
}

/// Carry out `strategy`. In-process launches hand the context back to the caller.
pub async fn launch(
    strategy: LaunchStrategy,
    context: CodeContext,
    cache_dir: &Path,
    window: Duration,
) -> Result<LaunchOutcome> {
    info!("launch: using {} strategy", strategy.label());
    if let LaunchStrategy::InProcess { entry, parameters } = strategy {
        return Ok(LaunchOutcome::InProcess(HostedApp::new(
            context, entry, parameters,
        )));
    }
    match strategy.prepare(cache_dir)? {
        Some(cmd) => spawn_and_supervise(cmd, window).await,
        None => Err(BootstrapError::Configuration),
    }
}
