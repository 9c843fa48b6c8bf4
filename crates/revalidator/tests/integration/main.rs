// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod config;
pub mod dashboard;
pub mod multi_thread;
pub mod utils;

pub use utils::*;
