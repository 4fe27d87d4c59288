use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::state::{BootstrapEvent, Phase};
use crate::error::FailureReport;
use crate::util::progress_percent;

const PROGRESS_TEMPLATE: &str = "{prefix:>8} [{bar:40}] {pos:>3}% {msg}";

/// Presentation side of a bootstrap run. Every callback runs on the
/// dispatcher task, in the order the worker emitted the events.
pub trait BootstrapObserver: Send + 'static {
    fn phase_changed(&mut self, phase: Phase);

    fn progress(&mut self, fraction: f64);

    fn whats_new(&mut self, url: &str) {
        info!("ui: what's new at {url}");
    }

    fn failed(&mut self, report: &FailureReport);

    fn finished(&mut self, _lingering: bool) {}
}

fn dispatch<O: BootstrapObserver>(observer: &mut O, event: BootstrapEvent) {
    match event {
        BootstrapEvent::Phase(phase) => observer.phase_changed(phase),
        BootstrapEvent::Progress(fraction) => observer.progress(fraction),
        BootstrapEvent::WhatsNew(url) => observer.whats_new(&url),
        BootstrapEvent::Failure(report) => observer.failed(&report),
        BootstrapEvent::Finished { lingering } => observer.finished(lingering),
    }
}

/// Forward events to `observer` until every sender is dropped, then hand it back.
pub fn spawn_dispatcher<O: BootstrapObserver>(
    mut events: mpsc::UnboundedReceiver<BootstrapEvent>,
    mut observer: O,
) -> JoinHandle<O> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            dispatch(&mut observer, event);
        }
        observer
    })
}

/// Terminal observer: a progress bar for the download and the error chain on failure.
pub struct ConsoleObserver {
    bar: ProgressBar,
    open_pages: bool,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr(), true)
    }

    fn with_target(target: ProgressDrawTarget, open_pages: bool) -> Self {
        let bar = ProgressBar::with_draw_target(Some(100), target);
        match ProgressStyle::with_template(PROGRESS_TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("=> ")),
            Err(err) => warn!("ui: invalid progress template: {err}"),
        }
        Self { bar, open_pages }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapObserver for ConsoleObserver {
    fn phase_changed(&mut self, phase: Phase) {
        self.bar.set_prefix(phase.label());
        if phase.is_terminal() {
            self.bar.finish_and_clear();
        }
    }

    fn progress(&mut self, fraction: f64) {
        self.bar.set_position(progress_percent(fraction));
    }

    fn whats_new(&mut self, url: &str) {
        info!("ui: opening what's new page {url}");
        if self.open_pages
            && let Err(err) = open::that(url)
        {
            warn!("ui: unable to open {url}: {err}");
        }
    }

    fn failed(&mut self, report: &FailureReport) {
        self.bar.abandon_with_message(report.title.clone());
        eprintln!("{} (during {})", report.title, report.phase);
        for cause in &report.causes {
            eprintln!("  caused by: {cause}");
        }
    }

    fn finished(&mut self, lingering: bool) {
        if lingering {
            self.bar.set_message("application started");
        }
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    impl BootstrapObserver for Recorder {
        fn phase_changed(&mut self, phase: Phase) {
            self.seen.push(format!("phase:{phase}"));
        }

        fn progress(&mut self, fraction: f64) {
            self.seen.push(format!("progress:{fraction}"));
        }

        fn failed(&mut self, report: &FailureReport) {
            self.seen.push(format!("failed:{}", report.phase));
        }

        fn finished(&mut self, lingering: bool) {
            self.seen.push(format!("finished:{lingering}"));
        }
    }

    #[tokio::test]
    async fn dispatcher_delivers_events_in_emission_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_dispatcher(rx, Recorder::default());

        tx.send(BootstrapEvent::Phase(Phase::Update)).unwrap();
        tx.send(BootstrapEvent::Phase(Phase::Syncfile)).unwrap();
        tx.send(BootstrapEvent::Progress(0.5)).unwrap();
        tx.send(BootstrapEvent::Progress(1.0)).unwrap();
        tx.send(BootstrapEvent::WhatsNew("https://example.com".into()))
            .unwrap();
        tx.send(BootstrapEvent::Finished { lingering: true }).unwrap();
        drop(tx);

        let recorder = handle.await.unwrap();
        assert_eq!(
            recorder.seen,
            vec![
                "phase:Update",
                "phase:Syncfile",
                "progress:0.5",
                "progress:1",
                "finished:true",
            ]
        );
    }

    #[test]
    fn console_progress_tracks_percentages() {
        let mut console = ConsoleObserver::with_target(ProgressDrawTarget::hidden(), false);
        console.phase_changed(Phase::Syncfile);
        console.progress(0.25);
        assert_eq!(console.position(), 25);
        console.progress(1.0);
        assert_eq!(console.position(), 100);
        console.whats_new("https://example.com/news");
    }
}
