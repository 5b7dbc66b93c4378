//! Weighted per-app progress aggregation.
//!
//! Each app's pipeline contributes fixed unit weights: resign 20, download
//! 40, send 10 and install 30. An app that skips the download drops those 40
//! units from its total, so per-app totals are always 100 or 60. The install
//! step is the only fractional contributor; it advances with the progress
//! responses streamed by the server.

use std::sync::Arc;

use tokio::sync::Mutex;

/// Observer for per-app progress updates: `(bundle_id, fraction)`.
pub type ProgressObserver = Arc<dyn Fn(&str, f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Resign,
    Download,
    Send,
    Install,
}

impl StepKind {
    pub fn units(self) -> u64 {
        match self {
            StepKind::Resign => 20,
            StepKind::Download => 40,
            StepKind::Send => 10,
            StepKind::Install => 30,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Completed {
    resign: bool,
    download: bool,
    send: bool,
    install_fraction: f64,
}

/// Progress for one app's pipeline run.
pub struct AppProgress {
    bundle_id: String,
    total_units: u64,
    includes_download: bool,
    completed: Mutex<Completed>,
    observer: Option<ProgressObserver>,
}

impl AppProgress {
    pub fn new(
        bundle_id: impl Into<String>,
        includes_download: bool,
        observer: Option<ProgressObserver>,
    ) -> Arc<Self> {
        let mut total_units = StepKind::Resign.units() + StepKind::Send.units()
            + StepKind::Install.units();
        if includes_download {
            total_units += StepKind::Download.units();
        }
        Arc::new(Self {
            bundle_id: bundle_id.into(),
            total_units,
            includes_download,
            completed: Mutex::new(Completed::default()),
            observer,
        })
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    /// 100 with a download step, 60 without.
    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    /// Mark a step fully complete.
    pub async fn complete(&self, step: StepKind) {
        debug_assert!(
            step != StepKind::Download || self.includes_download,
            "download units not part of this app's total"
        );
        let fraction = {
            let mut guard = self.completed.lock().await;
            match step {
                StepKind::Resign => guard.resign = true,
                StepKind::Download => guard.download = true,
                StepKind::Send => guard.send = true,
                StepKind::Install => guard.install_fraction = 1.0,
            }
            completed_fraction(&guard, self.total_units)
        };
        self.report(fraction);
    }

    /// Advance the install step to `fraction` of its 30 units. Regressions
    /// are ignored so a re-delivered update can never move progress backward.
    pub async fn update_install(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let overall = {
            let mut guard = self.completed.lock().await;
            if fraction <= guard.install_fraction {
                return;
            }
            guard.install_fraction = fraction;
            completed_fraction(&guard, self.total_units)
        };
        self.report(overall);
    }

    /// Overall fraction in `[0, 1]`.
    pub async fn fraction(&self) -> f64 {
        let guard = self.completed.lock().await;
        completed_fraction(&guard, self.total_units)
    }

    fn report(&self, fraction: f64) {
        if let Some(observer) = &self.observer {
            observer(&self.bundle_id, fraction);
        }
    }
}

fn completed_fraction(completed: &Completed, total_units: u64) -> f64 {
    let mut units = 0.0;
    if completed.resign {
        units += StepKind::Resign.units() as f64;
    }
    if completed.download {
        units += StepKind::Download.units() as f64;
    }
    if completed.send {
        units += StepKind::Send.units() as f64;
    }
    units += completed.install_fraction * StepKind::Install.units() as f64;
    units / total_units as f64
}
