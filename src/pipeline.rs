//! Sequential runner for the markup and sync steps, with a progress log.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{PipelineError, StoreError};
use crate::markup::{MarkupReport, reprice_file};
use crate::profiles::EntityKind;
use crate::sync::{CatalogSync, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStep {
    Markup,
    Sync(EntityKind),
}

impl PipelineStep {
    /// Markup first, so the product sync reads repriced products. Carousel
    /// slides come from a separate hand-off and are synced on their own.
    pub const DEFAULT: [PipelineStep; 5] = [
        Self::Markup,
        Self::Sync(EntityKind::Categories),
        Self::Sync(EntityKind::Banners),
        Self::Sync(EntityKind::Brands),
        Self::Sync(EntityKind::Products),
    ];
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Markup => f.write_str("markup"),
            Self::Sync(kind) => write!(f, "sync {kind}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEntry {
    pub at: DateTime<Utc>,
    /// None for entries about the run as a whole
    pub step: Option<PipelineStep>,
    pub message: String,
}

/// Whether a run is in progress, and everything logged since startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    pub running: bool,
    pub progress: Vec<ProgressEntry>,
}

impl RunState {
    fn log(&mut self, step: Option<PipelineStep>, message: impl Into<String>) {
        self.progress.push(ProgressEntry {
            at: Utc::now(),
            step,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StepOutcome {
    Markup(MarkupReport),
    Sync { entity: EntityKind, report: SyncReport },
}

/// Owns the pipeline run state. One run at a time; a second request while a
/// run is in progress is rejected with [`PipelineError::Busy`].
pub struct Pipeline {
    config: Config,
    sync: CatalogSync,
    steps: Vec<PipelineStep>,
    exclusive: Mutex<()>,
    state: Mutex<RunState>,
}

impl Pipeline {
    pub fn new(config: Config, sync: CatalogSync) -> Self {
        Self {
            config,
            sync,
            steps: PipelineStep::DEFAULT.to_vec(),
            exclusive: Mutex::new(()),
            state: Mutex::new(RunState::default()),
        }
    }

    /// Pipeline writing to the store named by `config`.
    pub fn from_config(config: Config) -> Result<Self, StoreError> {
        let sync = CatalogSync::new(Arc::new(config.store()?)).strict_indexes(config.strict_indexes);
        Ok(Self::new(config, sync))
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = PipelineStep>) -> Self {
        self.steps = steps.into_iter().collect();
        self
    }

    pub async fn state(&self) -> RunState {
        self.state.lock().await.clone()
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run(&self) -> Result<Vec<StepOutcome>, PipelineError> {
        let Ok(_exclusive) = self.exclusive.try_lock() else {
            info!("Pipeline already running, request rejected");
            self.state.lock().await.log(None, "Run rejected: already running");
            return Err(PipelineError::Busy);
        };

        {
            let mut state = self.state.lock().await;
            state.running = true;
            state.log(None, "Pipeline started");
        }
        info!(steps = self.steps.len(), "Pipeline started");

        let mut outcomes = Vec::with_capacity(self.steps.len());
        let mut failure = None;
        for &step in &self.steps {
            self.state.lock().await.log(Some(step), "Started");
            match self.run_step(step).await {
                Ok(outcome) => {
                    self.state.lock().await.log(Some(step), describe(&outcome));
                    outcomes.push(outcome);
                }
                Err(e) => {
                    error!(step = %step, error = %e, "Pipeline step failed");
                    self.state.lock().await.log(Some(step), format!("Failed: {e}"));
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut state = self.state.lock().await;
        state.running = false;
        match failure {
            Some(e) => {
                state.log(None, "Pipeline stopped");
                Err(e)
            }
            None => {
                state.log(None, "Pipeline completed");
                info!("Pipeline completed");
                Ok(outcomes)
            }
        }
    }

    async fn run_step(&self, step: PipelineStep) -> Result<StepOutcome, PipelineError> {
        match step {
            PipelineStep::Markup => {
                let report = reprice_file(&self.config.markup_input(), &self.config.markup_output())
                    .await
                    .map_err(PipelineError::Markup)?;
                Ok(StepOutcome::Markup(report))
            }
            PipelineStep::Sync(entity) => {
                let profile = self.config.profile(entity);
                let report = self
                    .sync
                    .run(&profile, &self.config.input_path(entity))
                    .await?;
                Ok(StepOutcome::Sync { entity, report })
            }
        }
    }
}

fn describe(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Markup(report) => format!(
            "Repriced {} of {} products ({} without price)",
            report.repriced, report.total, report.unpriced
        ),
        StepOutcome::Sync { report, .. } => format!("Completed: {report}"),
    }
}
