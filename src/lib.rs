// Library entrypoint for integration tests and internal reuse.
pub mod api;
pub mod config;
pub mod relay;
pub mod shutdown;
pub mod state;
pub mod storage;
