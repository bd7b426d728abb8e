//! Adapter collaborators and the leaf commands that bridge them
//!
//! Adapters (file, database, web, mail...) live outside this crate. They move
//! tabular blocks; [`AdapterReader`] and [`AdapterWriter`] translate those
//! blocks into and out of parameter-set streams.

use crate::command::{once, Command, CommandInfo, ParameterStream};
use crate::error::{BridgeError, Result};
use crate::parameters::{ParameterDef, ParameterSet, Value};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Parameter holding a whole block in [`Granularity::Block`] mode
pub const ROWS_PARAMETER: &str = "Rows";
/// Parameter holding the number of rows in a block
pub const ROW_COUNT_PARAMETER: &str = "RowCount";
/// Optional input selecting the adapter read block size
pub const BLOCK_SIZE_PARAMETER: &str = "BlockSize";

/// A block of tabular data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBlock {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl DataBlock {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Lazy sequence of blocks read from an adapter
pub type BlockStream = Box<dyn Iterator<Item = anyhow::Result<DataBlock>> + Send>;

/// External data source or sink
#[cfg_attr(test, mockall::automock)]
pub trait Adapter: Send + Sync {
    fn name(&self) -> String;

    fn connect(&self) -> anyhow::Result<()>;

    fn read_data(&self, block_size: Option<usize>) -> anyhow::Result<BlockStream>;

    fn write_data(&self, blocks: Vec<DataBlock>, delete_before: bool) -> anyhow::Result<()>;

    fn available_columns(&self) -> anyhow::Result<Vec<String>>;

    fn available_tables(&self) -> anyhow::Result<Vec<String>>;

    fn count(&self) -> anyhow::Result<u64>;

    fn disconnect(&self) -> anyhow::Result<()>;
}

/// Which way a value is moving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertDirection {
    /// External representation to parameter value
    Read,
    /// Parameter value to external representation
    Write,
}

/// Converts single values between adapter and parameter representation
pub trait ValueConverter: Send + Sync {
    fn convert(&self, raw: Value, direction: ConvertDirection, parameter: &ParameterDef) -> Result<Value>;
}

/// Converter leaving every value unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityConverter;

impl ValueConverter for IdentityConverter {
    fn convert(&self, raw: Value, _direction: ConvertDirection, _parameter: &ParameterDef) -> Result<Value> {
        Ok(raw)
    }
}

/// How rows map onto parameter sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One set per row, columns as parameters
    #[default]
    Row,
    /// One set per block, rows as an array of objects under `Rows`
    Block,
}

/// Source: emits the incoming set overlaid with adapter data, once per row or block
pub struct AdapterReader {
    info: CommandInfo,
    adapter: Arc<dyn Adapter>,
    converter: Arc<dyn ValueConverter>,
    granularity: Granularity,
    children: Vec<Box<dyn Command>>,
}

impl AdapterReader {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            info: CommandInfo::new(name)
                .with_group("source")
                .with_parameter(ParameterDef::input(BLOCK_SIZE_PARAMETER).with_default(Value::Null)),
            adapter,
            converter: Arc::new(IdentityConverter),
            granularity: Granularity::Row,
            children: Vec::new(),
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_child(mut self, child: impl Command + 'static) -> Self {
        self.children.push(Box::new(child));
        self
    }

    fn convert_row(&self, columns: &[String], row: Vec<Value>) -> Result<Vec<(String, Value)>> {
        columns
            .iter()
            .zip(row)
            .map(|(column, raw)| {
                let def = ParameterDef::output(column.clone());
                let value = self.converter.convert(raw, ConvertDirection::Read, &def)?;
                Ok((column.clone(), value))
            })
            .collect()
    }

    fn block_to_sets(&self, input: &ParameterSet, block: DataBlock) -> Vec<Result<ParameterSet>> {
        let DataBlock { columns, rows } = block;
        match self.granularity {
            Granularity::Row => rows
                .into_iter()
                .map(|row| {
                    let values = self.convert_row(&columns, row)?;
                    let mut set = input.clone();
                    for (name, value) in values {
                        set.set(name, value);
                    }
                    Ok(set)
                })
                .collect(),
            Granularity::Block => {
                let count = rows.len();
                let converted: Result<Vec<Value>> = rows
                    .into_iter()
                    .map(|row| {
                        let values = self.convert_row(&columns, row)?;
                        Ok(Value::Object(values.into_iter().collect()))
                    })
                    .collect();
                vec![converted.map(|rows| {
                    input
                        .clone()
                        .with(ROWS_PARAMETER, Value::Array(rows))
                        .with(ROW_COUNT_PARAMETER, count)
                })]
            }
        }
    }
}

impl Command for AdapterReader {
    fn info(&self) -> &CommandInfo {
        &self.info
    }

    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a> {
        let block_size = match self.info.resolve(&input, BLOCK_SIZE_PARAMETER) {
            Ok(value) => value.as_u64().map(|size| size as usize),
            Err(e) => return once(Err(e)),
        };
        Box::new(ReaderStream {
            reader: self,
            input,
            block_size,
            blocks: None,
            pending: VecDeque::new(),
            connected: false,
            finished: false,
        })
    }

    fn children(&self) -> &[Box<dyn Command>] {
        &self.children
    }

    fn set_children(&mut self, children: Vec<Box<dyn Command>>) -> Result<()> {
        self.children = children;
        Ok(())
    }
}

/// Pull-driven reader: connects on first pull, disconnects when exhausted or dropped
struct ReaderStream<'a> {
    reader: &'a AdapterReader,
    input: ParameterSet,
    block_size: Option<usize>,
    blocks: Option<BlockStream>,
    pending: VecDeque<Result<ParameterSet>>,
    connected: bool,
    finished: bool,
}

impl ReaderStream<'_> {
    fn open(&mut self) -> Result<()> {
        let adapter = &self.reader.adapter;
        debug!(
            command = self.reader.info.name.as_str(),
            adapter = adapter.name().as_str(),
            "Connecting adapter"
        );
        adapter.connect().map_err(BridgeError::Adapter)?;
        self.connected = true;
        let blocks = adapter
            .read_data(self.block_size)
            .map_err(BridgeError::Adapter)?;
        self.blocks = Some(blocks);
        Ok(())
    }

    fn release(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.blocks = None;
        if let Err(e) = self.reader.adapter.disconnect() {
            error!(
                command = self.reader.info.name.as_str(),
                "Adapter disconnect failed: {}", e
            );
        }
    }
}

impl Iterator for ReaderStream<'_> {
    type Item = Result<ParameterSet>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            if self.blocks.is_none() {
                if let Err(e) = self.open() {
                    self.finished = true;
                    self.release();
                    return Some(Err(e));
                }
            }

            let next_block = self.blocks.as_mut().and_then(|blocks| blocks.next());
            match next_block {
                Some(Ok(block)) => {
                    debug!(
                        command = self.reader.info.name.as_str(),
                        rows = block.len(),
                        "Block read"
                    );
                    let sets = self.reader.block_to_sets(&self.input, block);
                    self.pending.extend(sets);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    self.release();
                    return Some(Err(BridgeError::Adapter(e)));
                }
                None => {
                    self.finished = true;
                    self.release();
                }
            }
        }
    }
}

impl Drop for ReaderStream<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Default)]
struct WriterState {
    connected: bool,
    /// Blocks written since the run began
    written: usize,
}

/// Sink leaf: writes each incoming set to the adapter and emits it unchanged.
///
/// Connects on the first write and stays connected until [`Command::close`].
/// `delete_before` is passed on the first write of every run, so a scheduled
/// replace-mode copy clears the target on each fire.
pub struct AdapterWriter {
    info: CommandInfo,
    adapter: Arc<dyn Adapter>,
    converter: Arc<dyn ValueConverter>,
    columns: Vec<String>,
    granularity: Granularity,
    delete_before: bool,
    state: Mutex<WriterState>,
}

impl AdapterWriter {
    /// Writer for the given columns; each becomes a required input parameter in row mode
    pub fn new(name: impl Into<String>, adapter: Arc<dyn Adapter>, columns: Vec<String>) -> Self {
        let mut info = CommandInfo::new(name).with_group("sink");
        for column in &columns {
            info = info.with_parameter(ParameterDef::input(column.clone()));
        }
        Self {
            info,
            adapter,
            converter: Arc::new(IdentityConverter),
            columns,
            granularity: Granularity::Row,
            delete_before: false,
            state: Mutex::new(WriterState::default()),
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Block mode reads rows from the `Rows` parameter instead of the columns
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self.info
            .parameters
            .retain(|p| p.name != ROWS_PARAMETER && !self.columns.contains(&p.name));
        if granularity == Granularity::Block {
            self.info = self.info.clone().with_parameter(ParameterDef::input(ROWS_PARAMETER));
        } else {
            for column in &self.columns {
                self.info.parameters.push(ParameterDef::input(column.clone()));
            }
        }
        self
    }

    pub fn with_delete_before(mut self, delete_before: bool) -> Self {
        self.delete_before = delete_before;
        self
    }

    /// Number of blocks written since the run began
    pub fn written(&self) -> usize {
        self.lock_state().written
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WriterState> {
        // state holds two counters; a poisoned lock leaves them usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn convert_cell(&self, column: &str, raw: Value) -> Result<Value> {
        let def = ParameterDef::input(column);
        self.converter.convert(raw, ConvertDirection::Write, &def)
    }

    fn build_block(&self, input: &ParameterSet) -> Result<DataBlock> {
        let mut block = DataBlock::new(self.columns.clone());
        match self.granularity {
            Granularity::Row => {
                let mut row = Vec::with_capacity(self.columns.len());
                for column in &self.columns {
                    let raw = self.info.resolve(input, column)?;
                    row.push(self.convert_cell(column, raw)?);
                }
                block.rows.push(row);
            }
            Granularity::Block => {
                let rows = self.info.resolve(input, ROWS_PARAMETER)?;
                let rows = rows.as_array().ok_or_else(|| {
                    BridgeError::Other(format!(
                        "command '{}' expects '{}' to be an array",
                        self.info.name, ROWS_PARAMETER
                    ))
                })?;
                for record in rows {
                    let mut row = Vec::with_capacity(self.columns.len());
                    for column in &self.columns {
                        let raw = record.get(column).cloned().unwrap_or(Value::Null);
                        row.push(self.convert_cell(column, raw)?);
                    }
                    block.rows.push(row);
                }
            }
        }
        Ok(block)
    }

    fn write(&self, input: &ParameterSet) -> Result<()> {
        let block = self.build_block(input)?;
        let mut state = self.lock_state();
        if !state.connected {
            self.adapter.connect().map_err(BridgeError::Adapter)?;
            state.connected = true;
        }
        let delete_before = self.delete_before && state.written == 0;
        self.adapter
            .write_data(vec![block], delete_before)
            .map_err(BridgeError::Adapter)?;
        state.written += 1;
        Ok(())
    }
}

impl Command for AdapterWriter {
    fn info(&self) -> &CommandInfo {
        &self.info
    }

    fn run_step<'a>(&'a self, input: ParameterSet) -> ParameterStream<'a> {
        match self.write(&input) {
            Ok(()) => once(Ok(input)),
            Err(e) => once(Err(e)),
        }
    }

    fn begin_run(&self) {
        self.lock_state().written = 0;
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.connected {
            state.connected = false;
            info!(
                command = self.info.name.as_str(),
                blocks = state.written,
                "Disconnecting writer"
            );
            self.adapter.disconnect().map_err(BridgeError::Adapter)?;
        }
        Ok(())
    }
}
