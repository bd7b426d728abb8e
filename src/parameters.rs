//! Named, directioned values exchanged between commands

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Parameter value type
pub type Value = serde_json::Value;

/// Direction of a declared parameter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Must be supplied by the caller
    In,
    /// Produced by the command
    Out,
    /// Read and possibly overwritten
    InOut,
}

impl Direction {
    /// Whether the command reads this parameter from the incoming set
    pub fn is_input(&self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::InOut => write!(f, "inout"),
        }
    }
}

/// Parameter declared by a command definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterDef {
    pub name: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterDef {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::In,
            default: None,
        }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Out,
            default: None,
        }
    }

    pub fn in_out(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::InOut,
            default: None,
        }
    }

    /// Declare a default used when the incoming set lacks the parameter
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Ordered mapping of parameter name to value for one execution step.
///
/// Names are unique. Writing an existing name replaces the value in place and
/// keeps its position. A set handed downstream is owned by the receiver, so
/// commands copy (`clone`, [`ParameterSet::overlay`]) instead of mutating a set
/// a sibling may still see.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: Vec<(String, Value)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// String view of a parameter, if present and a JSON string
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or overwrite a parameter
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder form of [`ParameterSet::set`]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let position = self.entries.iter().position(|(key, _)| key == name)?;
        Some(self.entries.remove(position).1)
    }

    /// Copy of this set with every entry of `other` written over it
    pub fn overlay(&self, other: &ParameterSet) -> ParameterSet {
        let mut merged = self.clone();
        for (name, value) in &other.entries {
            merged.set(name.clone(), value.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// JSON object view, used for logging and the CLI
    pub fn to_json(&self) -> Value {
        let map: serde_json::Map<String, Value> = self.entries.iter().cloned().collect();
        Value::Object(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = ParameterSet::new();
        for (name, value) in iter {
            set.set(name, value);
        }
        set
    }
}

impl Serialize for ParameterSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_overwrites_in_place() {
        let mut set = ParameterSet::new().with("a", 1).with("b", 2);
        set.set("a", 10);

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("a"), Some(&json!(10)));
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_overlay_leaves_original_untouched() {
        let base = ParameterSet::new().with("File", "/in/a.csv").with("Run", 1);
        let extra = ParameterSet::new().with("Run", 2).with("Item", "x");

        let merged = base.overlay(&extra);

        assert_eq!(base.get("Run"), Some(&json!(1)));
        assert!(!base.contains("Item"));
        assert_eq!(merged.get("Run"), Some(&json!(2)));
        assert_eq!(merged.get_str("Item"), Some("x"));
        assert_eq!(merged.names().collect::<Vec<_>>(), vec!["File", "Run", "Item"]);
    }

    #[test]
    fn test_remove() {
        let mut set: ParameterSet = [("a", 1), ("b", 2)].into_iter().collect();
        assert_eq!(set.remove("a"), Some(json!(1)));
        assert_eq!(set.remove("a"), None);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_serializes_in_declared_order() {
        let set = ParameterSet::new().with("zeta", "z").with("alpha", "a");
        let text = serde_json::to_string(&set).unwrap();
        assert_eq!(text, r#"{"zeta":"z","alpha":"a"}"#);
    }

    #[test]
    fn test_direction_serde() {
        let direction: Direction = serde_yaml::from_str("inout").unwrap();
        assert_eq!(direction, Direction::InOut);
        assert!(direction.is_input());
        assert!(!Direction::Out.is_input());
    }
}
