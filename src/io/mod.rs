pub mod analyzer;
pub mod hub;
pub mod messages;
