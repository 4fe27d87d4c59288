use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::artifacts::ArtifactFetcher;
use crate::engine::state::{BootstrapEvent, Phase, PhaseCell};
use crate::error::{BootstrapError, FailureReport, Result};
use crate::loader::{CodeContext, LoaderBootstrap};
use crate::manifest::Manifest;
use crate::networking::NetworkClient;
use crate::process::{self, LaunchEnvironment, LaunchOutcome, LaunchStrategy, SUPERVISION_WINDOW};
use crate::storage::{LocationOverrides, ManifestStore, resolve_remote_location};

pub mod state;

/// Command-line switches that shape one bootstrap run.
#[derive(Clone, Debug)]
pub struct BootstrapOptions {
    pub offline: bool,
    pub ignore_ssl: bool,
    pub stop_on_update_errors: bool,
    pub overrides: LocationOverrides,
    pub supervision_window: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            offline: false,
            ignore_ssl: false,
            stop_on_update_errors: false,
            overrides: LocationOverrides::default(),
            supervision_window: SUPERVISION_WINDOW,
        }
    }
}

/// State threaded through every stage of one run.
pub struct BootstrapContext {
    pub manifest: Manifest,
    pub cache_dir: PathBuf,
    pub phase: PhaseCell,
    pub code: Option<CodeContext>,
}

impl BootstrapContext {
    pub fn new(manifest: Manifest, cache_dir: PathBuf) -> Self {
        Self {
            manifest,
            cache_dir,
            phase: PhaseCell::default(),
            code: None,
        }
    }
}

/// Single reporting path for fatal errors.
#[derive(Clone)]
pub struct FailureSink {
    events: mpsc::UnboundedSender<BootstrapEvent>,
}

impl FailureSink {
    pub fn new(events: mpsc::UnboundedSender<BootstrapEvent>) -> Self {
        Self { events }
    }

    pub fn report(&self, err: &BootstrapError, phase: Phase) -> FailureReport {
        let report = FailureReport::new(err, phase);
        error!("bootstrap: {report}");
        let _ = self.events.send(BootstrapEvent::Failure(report.clone()));
        report
    }
}

/// How a run ended.
pub enum Completion {
    Launched(LaunchOutcome),
    Failed {
        report: FailureReport,
        exit_code: i32,
    },
}

pub struct BootstrapSequencer {
    options: BootstrapOptions,
    launch_env: LaunchEnvironment,
    store: ManifestStore,
    fetcher: ArtifactFetcher,
    events: mpsc::UnboundedSender<BootstrapEvent>,
    sink: FailureSink,
}

impl BootstrapSequencer {
    pub fn new(
        options: BootstrapOptions,
        launch_env: LaunchEnvironment,
        events: mpsc::UnboundedSender<BootstrapEvent>,
    ) -> Self {
        let network = NetworkClient::new(options.ignore_ssl);
        Self {
            store: ManifestStore::new(network.clone()),
            fetcher: ArtifactFetcher::new(network),
            sink: FailureSink::new(events.clone()),
            options,
            launch_env,
            events,
        }
    }

    pub fn sink(&self) -> FailureSink {
        self.sink.clone()
    }

    /// Run the whole sequence on a background task. A panic inside the worker
    /// is reported through the failure sink like any other fatal error.
    pub fn start(self, ctx: BootstrapContext) -> JoinHandle<Completion> {
        let sink = self.sink();
        let phase = ctx.phase.clone();
        let worker = tokio::spawn(async move {
            let mut ctx = ctx;
            self.execute(&mut ctx).await
        });
        tokio::spawn(async move {
            match worker.await {
                Ok(completion) => completion,
                Err(join_err) => {
                    let err = BootstrapError::Worker(join_err.to_string());
                    let report = sink.report(&err, phase.get());
                    Completion::Failed {
                        report,
                        exit_code: err.exit_code(),
                    }
                }
            }
        })
    }

    pub async fn execute(&self, ctx: &mut BootstrapContext) -> Completion {
        match self.run(ctx).await {
            Ok(outcome) => {
                self.enter(ctx, Phase::Init);
                let _ = self.events.send(BootstrapEvent::Finished {
                    lingering: ctx.manifest.lingering_update_screen,
                });
                Completion::Launched(outcome)
            }
            Err(err) => {
                let report = self.sink.report(&err, ctx.phase.get());
                Completion::Failed {
                    report,
                    exit_code: err.exit_code(),
                }
            }
        }
    }

    async fn run(&self, ctx: &mut BootstrapContext) -> Result<LaunchOutcome> {
        self.enter(ctx, Phase::Update);
        self.update_manifest(ctx).await?;

        self.enter(ctx, Phase::Syncfile);
        let files_updated = self.sync_artifacts(ctx).await?;

        self.enter(ctx, Phase::Wrapper);
        let code = LoaderBootstrap::build(&ctx.manifest, &ctx.cache_dir, ctx.code.take())?;
        if files_updated {
            self.announce_whats_new(&ctx.manifest, &code);
        }

        self.enter(ctx, Phase::Create);
        let decided = LaunchStrategy::decide(&ctx.manifest, &ctx.cache_dir, &code, &self.launch_env);
        let strategy = match decided {
            Ok(strategy) => strategy,
            Err(err) => {
                ctx.code = Some(code);
                return Err(err);
            }
        };

        self.enter(ctx, Phase::Prepare);
        debug!(
            "bootstrap: {} launch from {}",
            strategy.label(),
            ctx.cache_dir.display()
        );

        self.enter(ctx, Phase::Start);
        process::launch(
            strategy,
            code,
            &ctx.cache_dir,
            self.options.supervision_window,
        )
        .await
    }

    fn enter(&self, ctx: &BootstrapContext, phase: Phase) {
        ctx.phase.set(phase);
        info!("bootstrap: phase {phase}");
        let _ = self.events.send(BootstrapEvent::Phase(phase));
    }

    /// Recoverable update failures are logged and ignored unless strict mode is on.
    fn tolerate(&self, err: BootstrapError) -> Result<()> {
        if self.options.stop_on_update_errors {
            return Err(err);
        }
        warn!("bootstrap: continuing with cached state: {err}");
        Ok(())
    }

    /// Fetch the remote manifest and reconcile it into the context.
    /// Returns whether a new manifest was adopted.
    pub async fn update_manifest(&self, ctx: &mut BootstrapContext) -> Result<bool> {
        if self.options.offline {
            info!("bootstrap: offline mode, skipping manifest update");
            return Ok(false);
        }
        let location = resolve_remote_location(&ctx.manifest, &self.options.overrides);
        info!("bootstrap: checking {location} for updates");

        let remote = if self.options.stop_on_update_errors {
            self.store.try_fetch_remote(&location).await?
        } else {
            match self.store.fetch_remote(&location).await {
                Some(remote) => remote,
                None => return Ok(false),
            }
        };
        match ManifestStore::reconcile(&mut ctx.manifest, remote, &location, &ctx.cache_dir).await
        {
            Ok(adopted) => Ok(adopted),
            Err(err) => self.tolerate(err).map(|_| false),
        }
    }

    /// Point the presentation side at the release notes after new files were
    /// downloaded. A page shipped as an artifact is served from the cache.
    pub fn announce_whats_new(&self, manifest: &Manifest, code: &CodeContext) {
        let Some(page) = manifest
            .whats_new_page
            .as_deref()
            .map(str::trim)
            .filter(|page| !page.is_empty())
        else {
            return;
        };
        let target = match code.find_resource(page) {
            Some(local) => local.display().to_string(),
            None => page.to_owned(),
        };
        let _ = self.events.send(BootstrapEvent::WhatsNew(target));
    }

    /// Download changed artifacts. Returns whether the cache changed.
    pub async fn sync_artifacts(&self, ctx: &mut BootstrapContext) -> Result<bool> {
        if self.options.offline {
            info!("bootstrap: offline mode, skipping artifact sync");
            return Ok(false);
        }
        let events = self.events.clone();
        let synced = self
            .fetcher
            .sync(&ctx.manifest, &ctx.cache_dir, |fraction| {
                let _ = events.send(BootstrapEvent::Progress(fraction));
            })
            .await;
        match synced {
            Ok(changed) => Ok(changed),
            Err(err) if err.is_recoverable() => self.tolerate(err).map(|_| false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EXIT_FAILURE, EXIT_NOT_CONFIGURED};
    use crate::manifest::ArtifactDescriptor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn launch_env() -> LaunchEnvironment {
        LaunchEnvironment {
            hosting_shell: true,
            raw_args: vec![],
            current_exe: PathBuf::from("/opt/shell/app-bootstrap"),
            host_tag: crate::env::host_platform_tag(),
        }
    }

    fn sequencer(
        options: BootstrapOptions,
    ) -> (BootstrapSequencer, mpsc::UnboundedReceiver<BootstrapEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BootstrapSequencer::new(options, launch_env(), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BootstrapEvent>) -> Vec<BootstrapEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn baseline(source: &str) -> Manifest {
        Manifest {
            source: source.into(),
            version: "1.0".into(),
            launch_class: Some("app_main".into()),
            artifacts: vec![ArtifactDescriptor {
                path: "lib/app.dat".into(),
                size: 16,
                platforms: vec![],
                sha256: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn offline_with_empty_cache_surfaces_resolution_error() {
        let cache = tempfile::tempdir().unwrap();
        let options = BootstrapOptions {
            offline: true,
            ..Default::default()
        };
        let (sequencer, mut rx) = sequencer(options);
        let mut ctx = BootstrapContext::new(
            baseline("https://unreachable.invalid/app"),
            cache.path().to_path_buf(),
        );

        assert!(!sequencer.sync_artifacts(&mut ctx).await.unwrap());

        match sequencer.execute(&mut ctx).await {
            Completion::Failed { report, exit_code } => {
                assert_eq!(report.phase, Phase::Create);
                assert_eq!(report.title, "Application entry point not found");
                assert_eq!(exit_code, EXIT_FAILURE);
            }
            Completion::Launched(_) => panic!("launch should fail without an entry point"),
        }
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, BootstrapEvent::Progress(_))));
        assert!(matches!(events.last(), Some(BootstrapEvent::Failure(_))));
    }

    #[tokio::test]
    async fn identical_remote_with_warm_cache_fetches_only_the_manifest() {
        let server = MockServer::start().await;
        let source = format!("{}/app", server.uri());
        let local = baseline(&source);

        let mut remote = local.clone();
        remote.source = "https://somewhere-else.example/app".into();
        Mock::given(method("GET"))
            .and(path("/app/app.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(remote.to_json().unwrap()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/app/lib/app.dat"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
            .mount(&server)
            .await;

        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(cache.path().join("lib")).unwrap();
        std::fs::write(cache.path().join("lib/app.dat"), [0u8; 16]).unwrap();

        let (sequencer, _rx) = sequencer(BootstrapOptions::default());
        let mut ctx = BootstrapContext::new(local, cache.path().to_path_buf());
        assert!(!sequencer.update_manifest(&mut ctx).await.unwrap());
        assert!(!sequencer.sync_artifacts(&mut ctx).await.unwrap());

        let requests = server.received_requests().await.unwrap();
        let paths: Vec<_> = requests.iter().map(|r| r.url.path().to_owned()).collect();
        assert_eq!(paths, vec!["/app/app.json".to_owned()]);
        assert_eq!(ctx.manifest.source, source);
    }

    #[tokio::test]
    async fn newer_remote_is_adopted_and_synced() {
        let server = MockServer::start().await;
        let source = format!("{}/app", server.uri());
        let mut remote = baseline("https://payload.example/ignored");
        remote.version = "1.1".into();
        remote.whats_new_page = Some("https://example.com/news".into());
        Mock::given(method("GET"))
            .and(path("/app/app.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(remote.to_json().unwrap()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/app/lib/app.dat"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; 16]))
            .expect(1)
            .mount(&server)
            .await;

        let cache = tempfile::tempdir().unwrap();
        let (sequencer, mut rx) = sequencer(BootstrapOptions::default());
        let mut ctx = BootstrapContext::new(baseline(&source), cache.path().to_path_buf());

        assert!(sequencer.update_manifest(&mut ctx).await.unwrap());
        assert_eq!(ctx.manifest.version, "1.1");
        assert_eq!(ctx.manifest.source, source);
        assert!(sequencer.sync_artifacts(&mut ctx).await.unwrap());
        assert_eq!(std::fs::read(cache.path().join("lib/app.dat")).unwrap(), vec![5u8; 16]);
        assert_eq!(
            drain(&mut rx).last(),
            Some(&BootstrapEvent::Progress(1.0))
        );

        let code = LoaderBootstrap::build(&ctx.manifest, &ctx.cache_dir, None).unwrap();
        sequencer.announce_whats_new(&ctx.manifest, &code);
        assert_eq!(
            drain(&mut rx),
            vec![BootstrapEvent::WhatsNew("https://example.com/news".into())]
        );
    }

    #[tokio::test]
    async fn shipped_whats_new_page_is_served_from_the_cache() {
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(cache.path().join("docs")).unwrap();
        std::fs::write(cache.path().join("docs/news.html"), b"<h1>1.1</h1>").unwrap();

        let mut manifest = baseline("https://unreachable.invalid/app");
        manifest.whats_new_page = Some("docs/news.html".into());
        manifest.artifacts.push(ArtifactDescriptor {
            path: "docs/news.html".into(),
            size: 12,
            platforms: vec![],
            sha256: None,
        });
        let code = LoaderBootstrap::build(&manifest, cache.path(), None).unwrap();

        let (sequencer, mut rx) = sequencer(BootstrapOptions::default());
        sequencer.announce_whats_new(&manifest, &code);
        let expected = cache.path().join("docs/news.html").display().to_string();
        assert_eq!(drain(&mut rx), vec![BootstrapEvent::WhatsNew(expected)]);
    }

    #[tokio::test]
    async fn whats_new_follows_downloaded_files() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("lib")).unwrap();
        std::fs::write(source.path().join("lib/app.dat"), [1u8; 16]).unwrap();
        let mut manifest = baseline(source.path().to_str().unwrap());
        manifest.whats_new_page = Some("https://example.com/news".into());

        let cache = tempfile::tempdir().unwrap();
        let whats_new = |events: Vec<BootstrapEvent>| {
            events
                .into_iter()
                .filter(|e| matches!(e, BootstrapEvent::WhatsNew(_)))
                .count()
        };

        let (first, mut rx) = sequencer(BootstrapOptions::default());
        let mut ctx = BootstrapContext::new(manifest.clone(), cache.path().to_path_buf());
        assert!(matches!(first.execute(&mut ctx).await, Completion::Failed { .. }));
        assert_eq!(whats_new(drain(&mut rx)), 1);

        let (second, mut rx) = sequencer(BootstrapOptions::default());
        let mut ctx = BootstrapContext::new(manifest, cache.path().to_path_buf());
        assert!(matches!(second.execute(&mut ctx).await, Completion::Failed { .. }));
        assert_eq!(whats_new(drain(&mut rx)), 0);
    }

    #[tokio::test]
    async fn unreachable_manifest_is_tolerated_unless_strict() {
        let cache = tempfile::tempdir().unwrap();
        let missing = cache.path().join("remote");
        let manifest = baseline(missing.to_str().unwrap());

        let (lenient, _rx) = sequencer(BootstrapOptions::default());
        let mut ctx = BootstrapContext::new(manifest.clone(), cache.path().to_path_buf());
        assert!(!lenient.update_manifest(&mut ctx).await.unwrap());
        assert_eq!(ctx.manifest, manifest);

        let (strict, _rx) = sequencer(BootstrapOptions {
            stop_on_update_errors: true,
            ..Default::default()
        });
        let mut ctx = BootstrapContext::new(manifest, cache.path().to_path_buf());
        match strict.execute(&mut ctx).await {
            Completion::Failed { report, exit_code } => {
                assert_eq!(report.phase, Phase::Update);
                assert_eq!(exit_code, EXIT_FAILURE);
            }
            Completion::Launched(_) => panic!("strict mode should stop on update errors"),
        }
    }

    #[tokio::test]
    async fn missing_launch_configuration_exits_distinctly() {
        let cache = tempfile::tempdir().unwrap();
        let mut manifest = baseline("https://unreachable.invalid/app");
        manifest.launch_class = None;
        let (sequencer, _rx) = sequencer(BootstrapOptions {
            offline: true,
            ..Default::default()
        });
        let mut ctx = BootstrapContext::new(manifest, cache.path().to_path_buf());

        match sequencer.execute(&mut ctx).await {
            Completion::Failed { exit_code, .. } => assert_eq!(exit_code, EXIT_NOT_CONFIGURED),
            Completion::Launched(_) => panic!("nothing to launch"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn phases_arrive_in_order_on_a_successful_launch() {
        use std::os::unix::fs::PermissionsExt;

        let cache = tempfile::tempdir().unwrap();
        let script = cache.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut manifest = baseline("https://unreachable.invalid/app");
        manifest.launch_command = Some("run.sh".into());
        manifest.artifacts.clear();
        let (sequencer, mut rx) = sequencer(BootstrapOptions {
            offline: true,
            ..Default::default()
        });
        let ctx = BootstrapContext::new(manifest, cache.path().to_path_buf());

        let completion = sequencer.start(ctx).await.unwrap();
        assert!(matches!(
            completion,
            Completion::Launched(LaunchOutcome::ChildExited { code: Some(0) })
        ));

        let phases: Vec<Phase> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                BootstrapEvent::Phase(phase) => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                Phase::Update,
                Phase::Syncfile,
                Phase::Wrapper,
                Phase::Create,
                Phase::Prepare,
                Phase::Start,
                Phase::Init,
            ]
        );
    }
}
