//! Node configuration.
//!
//! - `node` - the [`NodeConfig`] structure and its validation
//! - `parser` - locating and loading `node.yaml`

mod node;
mod parser;

pub use node::*;
pub use parser::*;
