pub mod echo_server;
pub mod util;
