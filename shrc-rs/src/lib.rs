mod counter;
mod shared;

pub use shared::*;
