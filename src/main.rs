use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

use clap::Parser;
use env_logger::{Env, Target};
use log::{error, info, warn};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;

mod artifacts;
mod engine;
mod env;
mod error;
mod loader;
mod manifest;
mod networking;
mod process;
mod storage;
mod ui;
mod util;

use engine::{BootstrapContext, BootstrapOptions, BootstrapSequencer, Completion};
use error::{BootstrapError, EXIT_FAILURE, EXIT_SUCCESS};
use loader::LoaderBootstrap;
use process::{APP_PARAMETERS_FLAG, LaunchEnvironment, LaunchOutcome, MODULE_PATH_FLAG};
use storage::{LocationOverrides, ManifestStore};

#[derive(Parser, Debug)]
#[command(
    name = "app-bootstrap",
    author,
    version,
    about = "Keeps an application's files in sync with a published manifest, then launches it"
)]
struct Cli {
    /// Skip the manifest check and artifact download; launch from the cache.
    #[arg(long)]
    offline: bool,

    /// Accept any TLS certificate and host name.
    #[arg(long = "ignoressl")]
    ignore_ssl: bool,

    /// Treat a failed update as fatal instead of launching the cached version.
    #[arg(long = "stopOnUpdateErrors")]
    stop_on_update_errors: bool,

    /// Write the log to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    logfile: Option<PathBuf>,

    /// Full location of the manifest to check.
    #[arg(long, value_name = "LOCATION")]
    app: Option<String>,

    /// Directory location holding the manifest to check.
    #[arg(long, value_name = "LOCATION")]
    uri: Option<String>,

    /// Always start the application as a separate process.
    #[arg(long)]
    external: bool,

    /// Artifact locations for a re-invoked hosting shell.
    #[arg(long = "module-path", hide = true, value_name = "PATHS")]
    module_path: Option<OsString>,

    /// Manifest launch parameters for a re-invoked hosting shell.
    #[arg(
        long = "app-parameters",
        hide = true,
        value_name = "PARAMS",
        allow_hyphen_values = true
    )]
    app_parameters: Option<String>,

    /// Remaining arguments, including `app=` and `uri=` overrides. Passed to the application.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    /// Named flags win over `key=value` positionals.
    fn overrides(&self) -> LocationOverrides {
        let positional = |key: &str| {
            self.args
                .iter()
                .find_map(|arg| arg.strip_prefix(key)?.strip_prefix('=').map(str::to_owned))
                .filter(|value| !value.trim().is_empty())
        };
        LocationOverrides {
            app: self.app.clone().or_else(|| positional("app")),
            uri: self.uri.clone().or_else(|| positional("uri")),
        }
    }

    fn options(&self) -> BootstrapOptions {
        BootstrapOptions {
            offline: self.offline,
            ignore_ssl: self.ignore_ssl,
            stop_on_update_errors: self.stop_on_update_errors,
            overrides: self.overrides(),
            ..Default::default()
        }
    }
}

fn init_logging(logfile: Option<&Path>) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(path) = logfile {
        match File::create(path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("unable to open log file {}: {err}", path.display()),
        }
    }
    builder.init();
}

fn raw_args() -> Vec<String> {
    std::env::args_os()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

/// Split a re-invoked shell's arguments into the application's arguments and
/// the entry name, which always comes last.
fn hosted_invocation(raw: &[String]) -> Option<(Vec<String>, String)> {
    const SHELL_FLAGS: [&str; 2] = [MODULE_PATH_FLAG, APP_PARAMETERS_FLAG];

    let (entry, rest) = raw.split_last()?;
    let mut args = Vec::with_capacity(rest.len());
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        if SHELL_FLAGS.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        let inline = SHELL_FLAGS
            .iter()
            .any(|flag| arg.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')));
        if !inline {
            args.push(arg.clone());
        }
    }
    Some((args, entry.clone()))
}

fn build_runtime() -> Option<Runtime> {
    match Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => Some(rt),
        Err(err) => {
            warn!("failed to create multithreaded runtime ({err}); trying single-threaded runtime");
            match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => Some(rt),
                Err(fallback_err) => {
                    error!("failed to create any Tokio runtime ({fallback_err})");
                    None
                }
            }
        }
    }
}

/// Child side of the module-path strategy: host the entry point in this process.
fn run_hosted(module_path: &OsString, parameters: Option<&str>, raw: &[String]) -> i32 {
    let Some((args, entry_name)) = hosted_invocation(raw) else {
        error!("hosting shell started without an entry point");
        return EXIT_FAILURE;
    };
    let hosted = LoaderBootstrap::from_module_path(module_path).and_then(|context| {
        let entry = context.resolve_entry(&entry_name)?;
        let parameters = process::split_parameters(parameters)?;
        Ok(process::HostedApp::new(context, entry, parameters))
    });
    match hosted {
        Ok(app) => app.run(&args),
        Err(err) => {
            error!("{}", error::FailureReport::new(&err, engine::state::Phase::Create));
            err.exit_code()
        }
    }
}

fn run(cli: &Cli, raw: Vec<String>) -> i32 {
    let Some(runtime) = build_runtime() else {
        return EXIT_FAILURE;
    };

    let mut manifest = match ManifestStore::load_baseline() {
        Ok(manifest) => manifest,
        Err(err) => {
            error!("{}", error::FailureReport::new(&err, engine::state::Phase::Update));
            return err.exit_code();
        }
    };
    let cache_dir = manifest.cache_dir();
    info!(
        "bootstrap: version {} from {} cached in {}",
        manifest.version,
        manifest.source,
        cache_dir.display()
    );

    let launch_env = LaunchEnvironment::detect(raw.clone(), !cli.external);
    let options = cli.options();
    let (tx, rx) = mpsc::unbounded_channel();

    let completion = runtime.block_on(async {
        ManifestStore::overlay_cached(&mut manifest, &cache_dir).await;
        let dispatcher = ui::spawn_dispatcher(rx, ui::ConsoleObserver::new());
        let sequencer = BootstrapSequencer::new(options, launch_env, tx);
        let sink = sequencer.sink();
        let ctx = BootstrapContext::new(manifest, cache_dir);
        let completion = match sequencer.start(ctx).await {
            Ok(completion) => completion,
            Err(join_err) => {
                let err = BootstrapError::Worker(join_err.to_string());
                let report = sink.report(&err, engine::state::Phase::Update);
                Completion::Failed {
                    report,
                    exit_code: err.exit_code(),
                }
            }
        };
        drop(sink);
        if let Err(err) = dispatcher.await {
            warn!("ui: event dispatcher stopped: {err}");
        }
        completion
    });
    drop(runtime);

    match completion {
        Completion::Launched(LaunchOutcome::InProcess(app)) => {
            info!("bootstrap: running {} in process", app.entry().name);
            app.run(&raw)
        }
        Completion::Launched(LaunchOutcome::HandedOff { pid }) => {
            info!("bootstrap: application running as process {pid}");
            EXIT_SUCCESS
        }
        Completion::Launched(LaunchOutcome::ChildExited { code }) => {
            info!("bootstrap: application exited with {code:?}");
            EXIT_SUCCESS
        }
        Completion::Failed { exit_code, .. } => exit_code,
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.logfile.as_deref());

    let raw = raw_args();
    let code = match &cli.module_path {
        Some(module_path) => run_hosted(module_path, cli.app_parameters.as_deref(), &raw),
        None => run(&cli, raw),
    };
    std::process::exit(code);
}
