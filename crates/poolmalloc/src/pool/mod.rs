pub mod arena;
pub mod engine;
pub mod index;

pub use engine::{in_engine, Pool};
