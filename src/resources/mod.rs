pub mod bootstrap;
pub mod common;
pub mod init_container;
pub mod sidecar;
