pub mod chain;
pub mod product;
pub mod range;
pub mod transfer;

pub use range::{BlockNumber, Range, RangeValue};
