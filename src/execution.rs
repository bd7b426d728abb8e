//! Lazy depth-first execution of a command tree
//!
//! For every set a command emits, each active child runs in declared order
//! against its own copy of that set. Child output is forwarded first; the
//! command's own set for the step follows once all children are drained.
//! Nothing is buffered: pulling one item runs the tree just far enough to
//! produce it, and dropping the stream drops every open child stream.

use crate::command::{once, Command, ParameterStream};
use crate::error::Result;
use crate::parameters::ParameterSet;
use tracing::{debug, error, warn};

/// Execute `command` against a stream of incoming sets
pub fn execute<'a>(command: &'a dyn Command, incoming: ParameterStream<'a>) -> ParameterStream<'a> {
    Box::new(TreeExecution {
        command,
        incoming,
        own: None,
        step: None,
        emitted: 0,
        total: None,
    })
}

/// Execute `command` against a single incoming set
pub fn execute_once(command: &dyn Command, input: ParameterSet) -> ParameterStream<'_> {
    execute(command, once(Ok(input)))
}

/// Outcome of draining an execution stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Sets that reached the end of the stream
    pub steps: usize,
    /// Steps that failed
    pub failures: usize,
    /// Message of the first failure, if any
    pub first_error: Option<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures == 0
    }
}

/// Drain a stream, logging every failed step
pub fn run_to_end(stream: ParameterStream<'_>) -> RunSummary {
    let mut summary = RunSummary::default();
    for item in stream {
        match item {
            Ok(_) => summary.steps += 1,
            Err(e) => {
                error!("Step failed: {}", e);
                summary.failures += 1;
                summary.first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }
    summary
}

struct TreeExecution<'a> {
    command: &'a dyn Command,
    incoming: ParameterStream<'a>,
    /// Output of the command's own logic for the current incoming set
    own: Option<ParameterStream<'a>>,
    /// Emitted set whose children are still running
    step: Option<PendingStep<'a>>,
    /// Sets emitted so far for the current incoming set
    emitted: usize,
    /// Length of `own`, when the stream reports an exact size
    total: Option<usize>,
}

struct PendingStep<'a> {
    set: ParameterSet,
    children: std::vec::IntoIter<&'a dyn Command>,
    current: Option<ParameterStream<'a>>,
}

impl<'a> PendingStep<'a> {
    /// Next item from the children, or `None` once every child is drained
    fn advance(&mut self) -> Option<Result<ParameterSet>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            let child = self.children.next()?;
            self.current = Some(execute(child, once(Ok(self.set.clone()))));
        }
    }
}

impl<'a> Iterator for TreeExecution<'a> {
    type Item = Result<ParameterSet>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(step) = self.step.as_mut() {
                if let Some(item) = step.advance() {
                    return Some(item);
                }
                if let Some(done) = self.step.take() {
                    return Some(Ok(done.set));
                }
            }

            if let Some(own) = self.own.as_mut() {
                match own.next() {
                    Some(Ok(set)) => {
                        self.emitted += 1;
                        debug!(
                            command = self.command.name(),
                            index = self.emitted,
                            total = self.total,
                            "Step emitted"
                        );
                        let children = self.command.active_children(&set);
                        if children.is_empty() {
                            return Some(Ok(set));
                        }
                        self.step = Some(PendingStep {
                            set,
                            children: children.into_iter(),
                            current: None,
                        });
                    }
                    Some(Err(e)) => {
                        warn!(command = self.command.name(), "Step failed: {}", e);
                        return Some(Err(e));
                    }
                    None => self.own = None,
                }
                continue;
            }

            match self.incoming.next()? {
                Ok(set) => {
                    let own = self.command.run_step(set);
                    self.emitted = 0;
                    self.total = exact_len(own.size_hint());
                    self.own = Some(own);
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn exact_len(hint: (usize, Option<usize>)) -> Option<usize> {
    match hint {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    }
}
