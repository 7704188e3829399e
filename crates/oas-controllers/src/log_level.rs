//! Log-level controller
//!
//! Follows `spec.operatorLogLevel` of the operator configuration and swaps
//! the process-wide tracing filter to match.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, instrument};

use oas_common::crd::LogLevel;
use oas_common::events::reasons;
use oas_common::telemetry::{LogFilterHandle, DEFAULT_FILTER};
use oas_common::{Error, EventRecorder};

use crate::operator_client::OperatorState;
use crate::runner::Reconciler;

const CONTROLLER_NAME: &str = "LoggingSyncer";

/// Changes the process log filter at runtime
#[cfg_attr(test, automock)]
pub trait LogLevelSetter: Send + Sync {
    /// Directives currently in effect
    fn current(&self) -> String;

    /// Replace the active directives
    fn set(&self, directives: &str) -> Result<(), Error>;
}

impl LogLevelSetter for LogFilterHandle {
    fn current(&self) -> String {
        LogFilterHandle::current(self)
    }

    fn set(&self, directives: &str) -> Result<(), Error> {
        self.set_filter(directives)
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Filter directives for an operator log level
pub fn filter_for(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Normal => DEFAULT_FILTER,
        LogLevel::Debug => "debug,kube=debug,tower=warn,hyper=warn",
        LogLevel::Trace => "trace,kube=debug,tower=info,hyper=info",
        LogLevel::TraceAll => "trace",
    }
}

/// Applies the configured operator log level
pub struct LogLevelController {
    operator: Arc<dyn OperatorState>,
    setter: Arc<dyn LogLevelSetter>,
    events: Arc<dyn EventRecorder>,
}

impl LogLevelController {
    /// Create the controller
    pub fn new(
        operator: Arc<dyn OperatorState>,
        setter: Arc<dyn LogLevelSetter>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            operator,
            setter,
            events,
        }
    }
}

#[async_trait]
impl Reconciler for LogLevelController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self), fields(controller = CONTROLLER_NAME))]
    async fn sync(&self) -> Result<(), Error> {
        let operator = self.operator.get()?;
        let level = operator.spec.operator_log_level.unwrap_or_default();
        let desired = filter_for(level);
        let current = self.setter.current();
        if current == desired {
            return Ok(());
        }

        self.setter.set(desired)?;
        info!(from = %current, to = desired, ?level, "Changed operator log level");
        self.events
            .event(
                reasons::OPERATOR_LOG_LEVEL_CHANGE,
                format!("Operator log level changed from {:?} to {:?}", current, desired),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator_client::MockOperatorState;
    use oas_common::crd::{OpenShiftAPIServer, OpenShiftAPIServerSpec};
    use oas_common::NoopEventRecorder;
    use rstest::rstest;

    fn state_with(level: Option<LogLevel>) -> MockOperatorState {
        let mut state = MockOperatorState::new();
        state.expect_get().returning(move || {
            Ok(Arc::new(OpenShiftAPIServer::new(
                "cluster",
                OpenShiftAPIServerSpec {
                    operator_log_level: level,
                    ..Default::default()
                },
            )))
        });
        state
    }

    #[rstest]
    #[case(LogLevel::Normal, DEFAULT_FILTER)]
    #[case(LogLevel::Debug, "debug,kube=debug,tower=warn,hyper=warn")]
    #[case(LogLevel::TraceAll, "trace")]
    fn levels_map_to_filters(#[case] level: LogLevel, #[case] expected: &str) {
        assert_eq!(filter_for(level), expected);
    }

    #[tokio::test]
    async fn applies_changed_level() {
        let mut setter = MockLogLevelSetter::new();
        setter
            .expect_current()
            .returning(|| DEFAULT_FILTER.to_string());
        setter
            .expect_set()
            .withf(|d| d == "trace")
            .times(1)
            .returning(|_| Ok(()));

        let controller = LogLevelController::new(
            Arc::new(state_with(Some(LogLevel::TraceAll))),
            Arc::new(setter),
            Arc::new(NoopEventRecorder),
        );
        controller.sync().await.unwrap();
    }

    #[tokio::test]
    async fn unset_level_matching_default_is_noop() {
        let mut setter = MockLogLevelSetter::new();
        setter
            .expect_current()
            .returning(|| DEFAULT_FILTER.to_string());
        setter.expect_set().never();

        let controller = LogLevelController::new(
            Arc::new(state_with(None)),
            Arc::new(setter),
            Arc::new(NoopEventRecorder),
        );
        controller.sync().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_filter_is_an_error() {
        let mut setter = MockLogLevelSetter::new();
        setter.expect_current().returning(|| "info".to_string());
        setter
            .expect_set()
            .returning(|_| Err(Error::Config("reload failed".to_string())));

        let controller = LogLevelController::new(
            Arc::new(state_with(Some(LogLevel::Debug))),
            Arc::new(setter),
            Arc::new(NoopEventRecorder),
        );
        assert!(controller.sync().await.is_err());
    }
}
