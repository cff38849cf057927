//! Data model: bounding boxes, tuples and table names

mod hyperrectangle;
mod store_name;
mod tuple;

pub use hyperrectangle::{DoubleInterval, Hyperrectangle};
pub use store_name::TupleStoreName;
pub use tuple::{now_micros, Tuple, TupleKind};
