pub mod admission;
pub mod api;
pub mod config;
pub mod db;
pub mod dialer;
pub mod error;
pub mod gateway;
pub mod membership;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod synchronizer;
pub mod task_lock;
