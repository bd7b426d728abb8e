//! Built-in commands

pub mod adapter;
pub mod assign;
pub mod branch;
pub mod group;
pub mod looper;

pub use adapter::{AdapterReader, AdapterWriter};
pub use assign::Assign;
pub use branch::ConditionalBranch;
pub use group::Group;
pub use looper::{FileLooper, ValueLooper};
