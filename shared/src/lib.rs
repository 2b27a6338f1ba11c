pub mod protocol;
pub mod txt;
pub mod types;
