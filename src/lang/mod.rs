//! Runtime data model: values and the object heap.

pub mod heap;
pub mod value;
