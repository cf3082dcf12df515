pub mod concurrency;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod github;
pub mod ids;
pub mod jobs;
pub mod model;
pub mod processor;
pub mod server;
pub mod sync;
