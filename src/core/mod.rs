pub mod classifier;
pub mod monitor;
pub mod pet;
pub mod service;
pub mod state;
pub mod store;
