//! The `Command` abstraction: one node of a pipeline tree
//!
//! A command owns its children exclusively; trees are built bottom-up, so they
//! cannot contain cycles. Execution of a whole tree lives in [`crate::execution`].

use crate::error::{BridgeError, Result};
use crate::parameters::{Direction, ParameterDef, ParameterSet, Value};
use tracing::{debug, error};

/// Lazy stream of parameter sets. Errors are items: a failed step yields one
/// `Err` and nothing else for that step.
pub type ParameterStream<'a> = Box<dyn Iterator<Item = Result<ParameterSet>> + 'a>;

/// Static description of a command: name, group and declared parameters
#[derive(Debug, Clone, Default)]
pub struct CommandInfo {
    pub name: String,
    pub group: Option<String>,
    pub parameters: Vec<ParameterDef>,
}

impl CommandInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            parameters: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterDef) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Mutable access for changing a declared default after construction
    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut ParameterDef> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    /// Resolve a declared parameter for one step.
    ///
    /// The incoming value wins, then the declared default. An input parameter
    /// with neither is [`BridgeError::MissingParameter`]. Asking for a name the
    /// command never declared is a programming error.
    pub fn resolve(&self, set: &ParameterSet, name: &str) -> Result<Value> {
        let def = self.parameter(name).ok_or_else(|| {
            BridgeError::State(format!(
                "command '{}' does not declare parameter '{}'",
                self.name, name
            ))
        })?;

        if let Some(value) = set.get(name) {
            return Ok(value.clone());
        }
        if let Some(default) = &def.default {
            return Ok(default.clone());
        }
        if def.direction.is_input() {
            return Err(BridgeError::missing(&self.name, name));
        }
        Ok(Value::Null)
    }

    /// [`CommandInfo::resolve`] for a parameter that must be a string
    pub fn resolve_str(&self, set: &ParameterSet, name: &str) -> Result<String> {
        match self.resolve(set, name)? {
            Value::String(text) => Ok(text),
            Value::Null => Err(BridgeError::missing(&self.name, name)),
            other => Ok(other.to_string()),
        }
    }

    /// Check that every `In`/`InOut` parameter can be resolved
    pub fn check_inputs(&self, set: &ParameterSet) -> Result<()> {
        for def in self
            .parameters
            .iter()
            .filter(|p| p.direction != Direction::Out)
        {
            self.resolve(set, &def.name)?;
        }
        Ok(())
    }
}

/// A node in the pipeline tree
pub trait Command: Send + Sync {
    fn info(&self) -> &CommandInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    /// Own logic for one incoming set, producing this command's output sets.
    ///
    /// The incoming set is owned; outputs are new sets. Must stay lazy.
    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a>;

    /// Children declared on this command
    fn children(&self) -> &[Box<dyn Command>] {
        &[]
    }

    /// Children to run for one step emitted by this command
    fn active_children<'a>(&'a self, _set: &ParameterSet) -> Vec<&'a dyn Command> {
        self.children().iter().map(|child| child.as_ref()).collect()
    }

    /// Every child this command owns, used for disposal
    fn owned_children(&self) -> Vec<&dyn Command> {
        self.children().iter().map(|child| child.as_ref()).collect()
    }

    /// Replace the children. Only container commands accept this.
    fn set_children(&mut self, _children: Vec<Box<dyn Command>>) -> Result<()> {
        Err(BridgeError::State(format!(
            "command '{}' does not accept children",
            self.name()
        )))
    }

    /// Reset per-run state before the tree is driven again from the root
    fn begin_run(&self) {}

    /// Release held resources
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name())
            .field("children", &self.owned_children().len())
            .finish()
    }
}

/// Single-item stream helper
pub fn once<'a>(item: Result<ParameterSet>) -> ParameterStream<'a> {
    Box::new(std::iter::once(item))
}

/// Empty stream helper
pub fn empty<'a>() -> ParameterStream<'a> {
    Box::new(std::iter::empty())
}

/// Close a tree, children before parents.
///
/// Every node is closed even when some fail; the first error is returned.
pub fn dispose(command: &dyn Command) -> Result<()> {
    let mut first_error = None;

    for child in command.owned_children() {
        if let Err(e) = dispose(child) {
            first_error.get_or_insert(e);
        }
    }

    debug!(command = command.name(), "Closing command");
    if let Err(e) = command.close() {
        error!(command = command.name(), "Failed to close command: {}", e);
        first_error.get_or_insert(e);
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Call [`Command::begin_run`] on every command in the tree, parents first
pub fn prepare_run(command: &dyn Command) {
    command.begin_run();
    for child in command.owned_children() {
        prepare_run(child);
    }
}

/// Number of commands in a tree, counting every branch arm
pub fn tree_size(command: &dyn Command) -> usize {
    1 + command
        .owned_children()
        .into_iter()
        .map(tree_size)
        .sum::<usize>()
}
