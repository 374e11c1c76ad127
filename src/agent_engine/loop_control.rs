use crate::agent_engine::state::FailureKind;
use crate::config::AgentConfig;

/// Step budget and consecutive-failure accounting for one run.
pub struct LoopController {
    max_steps: u32,
    max_failures: u32,
    steps: u32,
    consecutive_failures: u32,
    /// Kind of the most recent failure, reported when the limit trips.
    last_failure: Option<FailureKind>,
}

impl LoopController {
    pub fn new(cfg: &AgentConfig) -> Self {
        Self {
            max_steps: cfg.max_steps,
            max_failures: cfg.max_consecutive_failures.max(1),
            steps: 0,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    /// Count a new step; returns its 1-based number.
    pub fn begin_step(&mut self) -> u32 {
        self.steps += 1;
        self.steps
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure = None;
    }

    /// A turn that produced no usable action, or whose action failed.
    pub fn record_failure(&mut self, kind: FailureKind) {
        self.consecutive_failures += 1;
        self.last_failure = Some(kind);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Reason to stop before the next step, if any.
    pub fn should_stop(&self) -> Option<FailureKind> {
        if self.consecutive_failures >= self.max_failures {
            return Some(self.last_failure.unwrap_or(FailureKind::ActionFailures));
        }
        if self.max_steps > 0 && self.steps >= self.max_steps {
            return Some(FailureKind::StepLimit);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_steps: u32, max_failures: u32) -> AgentConfig {
        AgentConfig {
            max_steps,
            max_consecutive_failures: max_failures,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn step_limit() {
        let mut lc = LoopController::new(&cfg(2, 5));
        assert_eq!(lc.begin_step(), 1);
        assert!(lc.should_stop().is_none());
        lc.begin_step();
        assert_eq!(lc.should_stop(), Some(FailureKind::StepLimit));
    }

    #[test]
    fn failures_reset_on_success() {
        let mut lc = LoopController::new(&cfg(0, 2));
        lc.record_failure(FailureKind::MalformedResponse);
        lc.record_success();
        lc.record_failure(FailureKind::MalformedResponse);
        assert!(lc.should_stop().is_none());
        lc.record_failure(FailureKind::MalformedResponse);
        assert_eq!(lc.should_stop(), Some(FailureKind::MalformedResponse));
    }
}
