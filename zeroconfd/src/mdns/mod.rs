pub mod browser;
pub mod daemon;
pub mod publisher;
pub mod resolve;
