mod activation;
mod continuation;
pub mod cores;
mod error;
mod heap;
mod interning;
mod interpreter;
mod lookup;
mod message;
mod objects;
mod stack;
mod tagged;
mod vm;

pub use activation::*;
pub use continuation::Snapshot;
pub use cores::{CoreError, CoreHandle, Exported, Parcel};
pub use error::*;
pub use heap::*;
pub use interning::*;
pub use lookup::*;
pub use message::*;
pub use objects::*;
pub use stack::*;
pub use tagged::*;
pub use vm::*;
