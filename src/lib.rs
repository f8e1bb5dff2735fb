pub mod api_server;
pub mod core;
pub mod io;
