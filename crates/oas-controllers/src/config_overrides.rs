//! Reports unsupported config overrides as a block on upgrades

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{instrument, warn};

use oas_common::crd::{ConditionStatus, OperatorCondition};
use oas_common::Error;

use crate::operator_client::OperatorState;
use crate::runner::Reconciler;

const CONTROLLER_NAME: &str = "UnsupportedConfigOverridesController";

/// Condition written by this controller
pub const UPGRADEABLE_CONDITION: &str = "UnsupportedConfigOverridesUpgradeable";

/// Condition describing whether `overrides` permit upgrades
pub fn overrides_condition(overrides: Option<&Value>) -> OperatorCondition {
    let Some(overrides) = overrides else {
        return OperatorCondition::new(UPGRADEABLE_CONDITION, ConditionStatus::True)
            .with_reason("NoUnsupportedConfigOverrides");
    };

    let message = match overrides {
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            format!("setting: {}", keys.join(", "))
        }
        other => format!("setting: {}", other),
    };
    OperatorCondition::new(UPGRADEABLE_CONDITION, ConditionStatus::False)
        .with_reason("UnsupportedConfigOverridesSet")
        .with_message(message)
}

/// Marks the operator not upgradeable while unsupported overrides are set
pub struct ConfigOverridesController {
    operator: Arc<dyn OperatorState>,
}

impl ConfigOverridesController {
    /// Create the controller
    pub fn new(operator: Arc<dyn OperatorState>) -> Self {
        Self { operator }
    }
}

#[async_trait]
impl Reconciler for ConfigOverridesController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self), fields(controller = CONTROLLER_NAME))]
    async fn sync(&self) -> Result<(), Error> {
        let operator = self.operator.get()?;
        let condition = overrides_condition(operator.unsupported_overrides());
        if condition.status == ConditionStatus::False {
            warn!(message = ?condition.message, "Unsupported config overrides in use");
        }
        self.operator.update_conditions(vec![condition]).await?;
        Ok(())
    }
}
