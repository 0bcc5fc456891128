//! Worker pools of a copy and the supervisors driving them.

pub mod base;
pub mod clone;
pub mod compare;
pub mod follow_up;
pub mod index;
pub mod pool;
pub mod sequences;
pub mod table_copy;
pub mod vacuum;
