pub mod batcher;
pub mod driver;
