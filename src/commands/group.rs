//! Container command: passes its incoming set through and fans out to children

use crate::command::{once, Command, CommandInfo, ParameterStream};
use crate::error::Result;
use crate::parameters::ParameterSet;

/// Plain container, typically the root of a pipeline
pub struct Group {
    info: CommandInfo,
    children: Vec<Box<dyn Command>>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: CommandInfo::new(name),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: impl Command + 'static) -> Self {
        self.children.push(Box::new(child));
        self
    }

    pub fn push(&mut self, child: Box<dyn Command>) {
        self.children.push(child);
    }
}

impl Command for Group {
    fn info(&self) -> &CommandInfo {
        &self.info
    }

    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a> {
        once(Ok(input))
    }

    fn children(&self) -> &[Box<dyn Command>] {
        &self.children
    }

    fn set_children(&mut self, children: Vec<Box<dyn Command>>) -> Result<()> {
        self.children = children;
        Ok(())
    }
}
