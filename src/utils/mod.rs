pub mod digest;
pub mod pattern;
