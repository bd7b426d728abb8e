//! Transform leaf writing configured `Out` parameters

use crate::command::{once, Command, CommandInfo, ParameterStream};
use crate::parameters::{ParameterDef, ParameterSet, Value};
use crate::pattern::expand_tokens;

/// Writes fixed values onto a copy of the incoming set.
///
/// String values may reference incoming parameters as `{Name}`.
pub struct Assign {
    info: CommandInfo,
    values: Vec<(String, Value)>,
}

impl Assign {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: CommandInfo::new(name).with_group("transform"),
            values: Vec::new(),
        }
    }

    pub fn with_value(mut self, parameter: impl Into<String>, value: impl Into<Value>) -> Self {
        let parameter = parameter.into();
        self.info = self.info.with_parameter(ParameterDef::output(parameter.clone()));
        self.values.push((parameter, value.into()));
        self
    }
}

impl Command for Assign {
    fn info(&self) -> &CommandInfo {
        &self.info
    }

    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a> {
        let mut output = input.clone();
        for (name, value) in &self.values {
            let value = match value {
                Value::String(text) => Value::String(expand_tokens(text, &input)),
                other => other.clone(),
            };
            output.set(name.clone(), value);
        }
        once(Ok(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::execute_once;
    use serde_json::json;

    #[test]
    fn test_assign_writes_values_and_tokens() {
        let assign = Assign::new("name_target")
            .with_value("Target", "/out/{FileName}")
            .with_value("Retries", 3);
        let input = ParameterSet::new().with("FileName", "a.csv");

        let output = execute_once(&assign, input.clone()).next().unwrap().unwrap();

        assert_eq!(output.get_str("Target"), Some("/out/a.csv"));
        assert_eq!(output.get("Retries"), Some(&json!(3)));
        assert!(!input.contains("Target"));
    }
}
