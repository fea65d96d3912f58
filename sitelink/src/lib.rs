mod arity;
mod block;
mod call_site;
mod cell;
mod checkpoint;
mod context;
mod coverage;
mod error;
mod global;
mod interning;
mod invalidator;
mod literal;
mod lookup;
mod method;
mod object;
mod options;
mod runtime;
mod scope;
mod specialize;
mod thunk;
mod value;

pub use arity::*;
pub use block::*;
pub use call_site::*;
pub use cell::DispatchCell;
pub use checkpoint::CheckpointSite;
pub use context::*;
pub use coverage::*;
pub use error::*;
pub use global::*;
pub use interning::*;
pub use invalidator::*;
pub use literal::*;
pub use lookup::*;
pub use method::*;
pub use object::*;
pub use options::LinkerOptions;
pub use runtime::*;
pub use scope::*;
pub use specialize::*;
pub use thunk::*;
pub use value::*;
