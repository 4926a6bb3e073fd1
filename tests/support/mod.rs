pub mod http;
pub mod workspace;
