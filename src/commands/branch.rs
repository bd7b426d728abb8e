//! Conditional branch: first matching arm wins

use crate::command::{once, Command, CommandInfo, ParameterStream};
use crate::condition::ConditionEvaluator;
use crate::error::{BridgeError, Result};
use crate::parameters::ParameterSet;
use std::sync::Arc;
use tracing::{debug, error};

/// One condition and the commands it guards
pub struct BranchArm {
    pub condition: String,
    pub commands: Vec<Box<dyn Command>>,
}

/// Runs the commands of the first arm whose condition holds.
///
/// Arms are fixed at construction. The children for a step are resolved per
/// step and never stored, so there is no settable child list. Without a match
/// the incoming set passes through and no children run. A condition that
/// cannot be evaluated is logged and treated as no match for that step.
pub struct ConditionalBranch {
    info: CommandInfo,
    evaluator: Arc<dyn ConditionEvaluator>,
    arms: Vec<BranchArm>,
}

impl ConditionalBranch {
    pub fn new(name: impl Into<String>, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self {
            info: CommandInfo::new(name).with_group("control"),
            evaluator,
            arms: Vec::new(),
        }
    }

    /// Append an arm; arms are evaluated in the order they were added
    pub fn with_arm(mut self, condition: impl Into<String>, commands: Vec<Box<dyn Command>>) -> Self {
        self.arms.push(BranchArm {
            condition: condition.into(),
            commands,
        });
        self
    }

    pub fn arms(&self) -> &[BranchArm] {
        &self.arms
    }

    /// Index of the first arm whose condition holds for `set`
    pub fn select(&self, set: &ParameterSet) -> Option<usize> {
        for (index, arm) in self.arms.iter().enumerate() {
            match self.evaluator.evaluate(&arm.condition, set) {
                Ok(true) => {
                    debug!(
                        command = self.info.name.as_str(),
                        arm = index,
                        condition = arm.condition.as_str(),
                        "Branch arm selected"
                    );
                    return Some(index);
                }
                Ok(false) => continue,
                Err(e) => {
                    error!(
                        command = self.info.name.as_str(),
                        condition = arm.condition.as_str(),
                        "Condition evaluation failed, passing through: {}",
                        e
                    );
                    return None;
                }
            }
        }
        debug!(command = self.info.name.as_str(), "No branch arm matched");
        None
    }
}

impl Command for ConditionalBranch {
    fn info(&self) -> &CommandInfo {
        &self.info
    }

    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a> {
        once(Ok(input))
    }

    fn active_children<'a>(&'a self, set: &ParameterSet) -> Vec<&'a dyn Command> {
        match self.select(set) {
            Some(index) => self.arms[index]
                .commands
                .iter()
                .map(|command| command.as_ref())
                .collect(),
            None => Vec::new(),
        }
    }

    fn owned_children(&self) -> Vec<&dyn Command> {
        self.arms
            .iter()
            .flat_map(|arm| arm.commands.iter().map(|command| command.as_ref()))
            .collect()
    }

    fn set_children(&mut self, _children: Vec<Box<dyn Command>>) -> Result<()> {
        Err(BridgeError::State(format!(
            "branch '{}' children are chosen by its conditions and cannot be set directly",
            self.info.name
        )))
    }
}
