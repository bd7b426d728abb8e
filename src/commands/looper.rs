//! Loopers: fan one incoming set out into one set per item
//!
//! Both loopers stream. The file looper pulls directory entries one at a time
//! as downstream asks for them; the value looper walks its configured list.

use crate::command::{once, Command, CommandInfo, ParameterStream};
use crate::error::Result;
use crate::parameters::{ParameterDef, ParameterSet};
use crate::pattern::{expand_env, expand_tokens, WildcardPattern};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const DIRECTORY_PARAMETER: &str = "Directory";
pub const FILTER_PARAMETER: &str = "Filter";
pub const FILE_PARAMETER: &str = "File";
pub const FILE_NAME_PARAMETER: &str = "FileName";

/// Lazy sequence of enumerated items
pub type ItemIter = Box<dyn Iterator<Item = Result<PathBuf>> + Send>;

/// Enumerates the items under a location, non-recursively
pub trait ItemSource: Send + Sync {
    fn enumerate(&self, location: &Path) -> Result<ItemIter>;
}

/// Regular files of a directory in file-system enumeration order
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectorySource;

impl ItemSource for DirectorySource {
    fn enumerate(&self, location: &Path) -> Result<ItemIter> {
        let entries = fs::read_dir(location)?;
        Ok(Box::new(entries.filter_map(|entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            match entry.file_type() {
                Ok(kind) if kind.is_file() => Some(Ok(entry.path())),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        })))
    }
}

/// Emits the incoming set plus `File` and `FileName` for every matching file
pub struct FileLooper {
    info: CommandInfo,
    source: Arc<dyn ItemSource>,
    children: Vec<Box<dyn Command>>,
}

impl FileLooper {
    pub fn new(name: impl Into<String>) -> Self {
        let info = CommandInfo::new(name)
            .with_group("control")
            .with_parameter(ParameterDef::input(DIRECTORY_PARAMETER))
            .with_parameter(ParameterDef::input(FILTER_PARAMETER).with_default("*"))
            .with_parameter(ParameterDef::output(FILE_PARAMETER))
            .with_parameter(ParameterDef::output(FILE_NAME_PARAMETER));
        Self {
            info,
            source: Arc::new(DirectorySource),
            children: Vec::new(),
        }
    }

    /// Default directory, used when the incoming set has none
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.set_default(DIRECTORY_PARAMETER, directory.into());
        self
    }

    /// Default filter pattern (`*` unless set)
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.set_default(FILTER_PARAMETER, filter.into());
        self
    }

    pub fn with_source(mut self, source: Arc<dyn ItemSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_child(mut self, child: impl Command + 'static) -> Self {
        self.children.push(Box::new(child));
        self
    }

    fn set_default(&mut self, name: &str, value: String) {
        if let Some(def) = self.info.parameter_mut(name) {
            def.default = Some(value.into());
        }
    }

    fn items<'a>(&'a self, input: ParameterSet) -> Result<ParameterStream<'a>> {
        let directory = self.info.resolve_str(&input, DIRECTORY_PARAMETER)?;
        let filter = self.info.resolve_str(&input, FILTER_PARAMETER)?;

        let directory = expand_env(&expand_tokens(&directory, &input));
        let pattern = WildcardPattern::new(&filter);
        debug!(
            command = self.info.name.as_str(),
            directory = directory.as_str(),
            filter = filter.as_str(),
            "Enumerating items"
        );

        let entries = self.source.enumerate(Path::new(&directory))?;
        let name = self.info.name.as_str();

        let matching = entries.filter(move |entry| match entry {
            Ok(path) => path
                .file_name()
                .map(|file_name| pattern.matches(&file_name.to_string_lossy()))
                .unwrap_or(false),
            Err(_) => true,
        });

        Ok(Box::new(matching.enumerate().map(move |(index, entry)| {
            let path = entry?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!(
                command = name,
                index = index + 1,
                file = file_name.as_str(),
                "Processing item {}",
                index + 1
            );
            Ok(input
                .clone()
                .with(FILE_PARAMETER, path.to_string_lossy().into_owned())
                .with(FILE_NAME_PARAMETER, file_name))
        })))
    }
}

impl Command for FileLooper {
    fn info(&self) -> &CommandInfo {
        &self.info
    }

    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a> {
        match self.items(input) {
            Ok(stream) => stream,
            Err(e) => once(Err(e)),
        }
    }

    fn children(&self) -> &[Box<dyn Command>] {
        &self.children
    }

    fn set_children(&mut self, children: Vec<Box<dyn Command>>) -> Result<()> {
        self.children = children;
        Ok(())
    }
}

/// One configured item of a [`ValueLooper`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueItem {
    pub name: String,
    pub values: ParameterSet,
}

impl ValueItem {
    pub fn new(name: impl Into<String>, values: ParameterSet) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Emits the incoming set overlaid with each item's values, in list order
pub struct ValueLooper {
    info: CommandInfo,
    items: Vec<ValueItem>,
    children: Vec<Box<dyn Command>>,
}

impl ValueLooper {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: CommandInfo::new(name).with_group("control"),
            items: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: ValueItem) -> Self {
        for name in item.values.names() {
            if self.info.parameter(name).is_none() {
                self.info.parameters.push(ParameterDef::output(name));
            }
        }
        self.items.push(item);
        self
    }

    pub fn with_child(mut self, child: impl Command + 'static) -> Self {
        self.children.push(Box::new(child));
        self
    }

    pub fn items(&self) -> &[ValueItem] {
        &self.items
    }
}

impl Command for ValueLooper {
    fn info(&self) -> &CommandInfo {
        &self.info
    }

    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a> {
        let total = self.items.len();
        let name = self.info.name.as_str();
        Box::new(self.items.iter().enumerate().map(move |(index, item)| {
            info!(
                command = name,
                index = index + 1,
                total,
                item = item.name.as_str(),
                "Processing item {} of {}",
                index + 1,
                total
            );
            Ok(input.overlay(&item.values))
        }))
    }

    fn children(&self) -> &[Box<dyn Command>] {
        &self.children
    }

    fn set_children(&mut self, children: Vec<Box<dyn Command>>) -> Result<()> {
        self.children = children;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::execution::execute_once;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Source producing `count` synthetic files and counting every pull
    struct CountingSource {
        count: usize,
        pulled: Arc<AtomicUsize>,
    }

    impl ItemSource for CountingSource {
        fn enumerate(&self, location: &Path) -> Result<ItemIter> {
            let pulled = self.pulled.clone();
            let location = location.to_path_buf();
            Ok(Box::new((0..self.count).map(move |i| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok(location.join(format!("file{}.csv", i)))
            })))
        }
    }

    #[test]
    fn test_file_looper_pulls_only_what_is_consumed() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let looper = FileLooper::new("files")
            .with_directory("/in")
            .with_source(Arc::new(CountingSource {
                count: 1000,
                pulled: pulled.clone(),
            }));

        let first = execute_once(&looper, ParameterSet::new())
            .next()
            .unwrap()
            .unwrap();

        assert_eq!(first.get_str(FILE_NAME_PARAMETER), Some("file0.csv"));
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_file_looper_lists_matching_files() {
        let dir = TempDir::new().unwrap();
        for name in ["a.csv", "b.CSV", "c.txt"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        fs::create_dir(dir.path().join("nested.csv")).unwrap();

        let looper = FileLooper::new("files")
            .with_directory(dir.path().to_string_lossy())
            .with_filter("*.csv");
        let outputs = execute_once(&looper, ParameterSet::new().with("Run", 7))
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let mut names: Vec<_> = outputs
            .iter()
            .map(|set| set.get_str(FILE_NAME_PARAMETER).unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.csv", "b.CSV"]);

        for set in &outputs {
            let file = PathBuf::from(set.get_str(FILE_PARAMETER).unwrap());
            assert_eq!(file.parent().unwrap(), dir.path());
            assert_eq!(set.get("Run"), Some(&serde_json::json!(7)));
        }
    }

    #[test]
    fn test_file_looper_zero_matches_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let looper = FileLooper::new("files").with_directory(dir.path().to_string_lossy());

        let items: Vec<_> = execute_once(&looper, ParameterSet::new()).collect();
        assert!(items.is_empty());
    }

    #[test]
    fn test_file_looper_directory_from_incoming_set() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("only.txt"), "x").unwrap();
        let looper = FileLooper::new("files").with_directory("/does/not/matter");
        let input = ParameterSet::new().with(DIRECTORY_PARAMETER, dir.path().to_string_lossy().into_owned());

        let outputs = execute_once(&looper, input).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].get_str(FILE_NAME_PARAMETER), Some("only.txt"));
    }

    #[test]
    fn test_file_looper_missing_directory() {
        let looper = FileLooper::new("files");
        let items: Vec<_> = execute_once(&looper, ParameterSet::new()).collect();

        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(BridgeError::MissingParameter { ref parameter, .. }) if parameter == DIRECTORY_PARAMETER
        ));
    }

    #[test]
    fn test_file_looper_unreadable_directory_is_io_error() {
        let looper = FileLooper::new("files").with_directory("/definitely/not/here");
        let items: Vec<_> = execute_once(&looper, ParameterSet::new()).collect();

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(BridgeError::Io(_))));
    }

    #[test]
    fn test_value_looper_overlays_items_in_order() {
        let looper = ValueLooper::new("regions")
            .with_item(ValueItem::new("north", ParameterSet::new().with("Region", "N").with("Code", 1)))
            .with_item(ValueItem::new("south", ParameterSet::new().with("Region", "S")));
        let input = ParameterSet::new().with("Region", "?").with("Batch", "b1");

        let outputs = execute_once(&looper, input)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].get_str("Region"), Some("N"));
        assert_eq!(outputs[0].get("Code"), Some(&serde_json::json!(1)));
        assert_eq!(outputs[1].get_str("Region"), Some("S"));
        assert!(!outputs[1].contains("Code"));
        assert!(outputs.iter().all(|set| set.get_str("Batch") == Some("b1")));
    }

    #[test]
    fn test_value_looper_empty_list_emits_nothing() {
        let looper = ValueLooper::new("nothing");
        assert_eq!(execute_once(&looper, ParameterSet::new()).count(), 0);
    }

    #[test]
    fn test_value_looper_runs_children_per_item() {
        let looper = ValueLooper::new("regions")
            .with_item(ValueItem::new("a", ParameterSet::new().with("Region", "A")))
            .with_item(ValueItem::new("b", ParameterSet::new().with("Region", "B")))
            .with_child(crate::commands::assign::Assign::new("tag").with_value("Tag", "{Region}!"));

        let tags: Vec<_> = execute_once(&looper, ParameterSet::new())
            .filter_map(|item| item.ok())
            .filter_map(|set| set.get_str("Tag").map(str::to_string))
            .collect();

        assert_eq!(tags, vec!["A!", "B!"]);
    }
}
