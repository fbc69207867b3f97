//! Ordered execution of migration steps with readiness gating.

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{Instrument, info, info_span};

use crate::error::MigrationError;
use crate::phase::MigrationPhase;
use crate::steps::Step;

/// Which steps to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSelection {
    /// Every step in order.
    All,
    /// Only these steps. Unselected earlier steps must already be ready.
    Only(BTreeSet<MigrationPhase>),
}

/// Outcome of one step, for the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Skipped and verified ready.
    Verified,
    Ran,
}

pub struct Sequencer {
    steps: Vec<Box<dyn Step>>,
}

impl Sequencer {
    /// Steps must be given in phase order, one per phase.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Result<Self> {
        let phases: Vec<MigrationPhase> = steps.iter().map(|s| s.phase()).collect();
        if phases.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MigrationError::Config(format!(
                "steps out of order: {:?}",
                phases
            ))
            .into());
        }
        Ok(Self { steps })
    }

    /// Walk the steps up to the highest selected phase. Unselected steps are
    /// checked for readiness, selected ones are run. Any error aborts.
    pub async fn execute(
        &self,
        selection: &StepSelection,
        dry_run: bool,
    ) -> Result<Vec<(MigrationPhase, StepOutcome)>> {
        let selected = |phase: MigrationPhase| match selection {
            StepSelection::All => true,
            StepSelection::Only(phases) => phases.contains(&phase),
        };
        let last = match selection {
            StepSelection::All => self.steps.last().map(|s| s.phase()),
            StepSelection::Only(phases) => phases.iter().next_back().copied(),
        };
        let Some(last) = last else {
            info!("No steps specified");
            return Ok(Vec::new());
        };

        let mut outcomes = Vec::new();
        for step in self.steps.iter().take_while(|s| s.phase() <= last) {
            let phase = step.phase();
            let span = info_span!("step", step = %phase.tag());

            if !selected(phase) {
                if !step.ready().instrument(span).await? {
                    return Err(MigrationError::PreconditionNotMet(phase).into());
                }
                info!(step = %phase.tag(), "Step ready");
                outcomes.push((phase, StepOutcome::Verified));
                continue;
            }

            async {
                info!("Running step");
                step.run(dry_run).await?;

                // A later step is about to rely on this one.
                if !dry_run && phase < last && !step.ready().await? {
                    return Err(MigrationError::PreconditionNotMet(phase).into());
                }
                info!("Step complete");
                Ok::<_, anyhow::Error>(())
            }
            .instrument(span)
            .await?;
            outcomes.push((phase, StepOutcome::Ran));
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Records ready/run calls; `run` makes the step ready unless dry-run.
    struct Recorder {
        phase: MigrationPhase,
        ready: Mutex<bool>,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Step for Recorder {
        fn phase(&self) -> MigrationPhase {
            self.phase
        }

        async fn ready(&self) -> Result<bool> {
            self.log.lock().unwrap().push(format!("ready {}", self.phase));
            Ok(*self.ready.lock().unwrap())
        }

        async fn run(&self, dry_run: bool) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("run {} dry_run={}", self.phase, dry_run));
            if self.fail {
                anyhow::bail!("{} failed", self.phase);
            }
            if !dry_run {
                *self.ready.lock().unwrap() = true;
            }
            Ok(())
        }
    }

    fn sequencer(
        ready: &[MigrationPhase],
        failing: Option<MigrationPhase>,
    ) -> (Sequencer, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = MigrationPhase::ALL
            .iter()
            .map(|&phase| {
                Box::new(Recorder {
                    phase,
                    ready: Mutex::new(ready.contains(&phase)),
                    fail: failing == Some(phase),
                    log: log.clone(),
                }) as Box<dyn Step>
            })
            .collect();
        (Sequencer::new(steps).unwrap(), log)
    }

    fn only(phases: &[MigrationPhase]) -> StepSelection {
        StepSelection::Only(phases.iter().copied().collect())
    }

    #[tokio::test]
    async fn test_all_runs_every_step_in_order() {
        let (seq, log) = sequencer(&[], None);
        let outcomes = seq.execute(&StepSelection::All, true).await.unwrap();
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|(_, o)| *o == StepOutcome::Ran));
        let log = log.lock().unwrap();
        assert_eq!(log.first().map(String::as_str), Some("run preflight dry_run=true"));
        assert_eq!(log.last().map(String::as_str), Some("run cleanup dry_run=true"));
        assert_eq!(log.len(), 6);
    }

    #[tokio::test]
    async fn test_all_aborts_on_first_error() {
        let (seq, log) = sequencer(&[], Some(MigrationPhase::Roll));
        assert!(seq.execute(&StepSelection::All, true).await.is_err());
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_selective_requires_earlier_steps_ready() {
        let (seq, log) = sequencer(&[MigrationPhase::Preflight], None);
        let err = seq
            .execute(&only(&[MigrationPhase::Roll]), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigrationError>(),
            Some(MigrationError::PreconditionNotMet(MigrationPhase::Prepare))
        ));
        assert!(!log.lock().unwrap().iter().any(|l| l.starts_with("run")));
    }

    #[tokio::test]
    async fn test_selective_runs_requested_after_gating() {
        let (seq, log) = sequencer(&[MigrationPhase::Preflight, MigrationPhase::Prepare], None);
        let outcomes = seq
            .execute(&only(&[MigrationPhase::Roll]), false)
            .await
            .unwrap();
        assert_eq!(
            outcomes,
            vec![
                (MigrationPhase::Preflight, StepOutcome::Verified),
                (MigrationPhase::Prepare, StepOutcome::Verified),
                (MigrationPhase::Roll, StepOutcome::Ran),
            ]
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec!["ready preflight", "ready prepare", "run roll dry_run=false"]
        );
    }

    #[tokio::test]
    async fn test_selective_verifies_run_before_later_step() {
        let (seq, log) = sequencer(&[MigrationPhase::Preflight], None);
        seq.execute(&only(&[MigrationPhase::Prepare, MigrationPhase::Roll]), false)
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "ready preflight",
                "run prepare dry_run=false",
                "ready prepare",
                "run roll dry_run=false"
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_selection_is_noop() {
        let (seq, log) = sequencer(&[], None);
        let outcomes = seq.execute(&only(&[]), false).await.unwrap();
        assert!(outcomes.is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_skips_post_run_verification() {
        let (seq, log) = sequencer(&[], None);
        seq.execute(&only(&[MigrationPhase::Preflight, MigrationPhase::Prepare]), true)
            .await
            .unwrap();
        assert!(!log.lock().unwrap().iter().any(|l| l.starts_with("ready")));
    }

    #[test]
    fn test_rejects_out_of_order_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn Step>> = [MigrationPhase::Roll, MigrationPhase::Prepare]
            .into_iter()
            .map(|phase| {
                Box::new(Recorder {
                    phase,
                    ready: Mutex::new(false),
                    fail: false,
                    log: log.clone(),
                }) as Box<dyn Step>
            })
            .collect();
        assert!(Sequencer::new(steps).is_err());
    }
}
