pub mod mode;
pub mod output;
pub mod resolution;
pub mod rotation;
