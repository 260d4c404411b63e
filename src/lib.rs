pub mod batch;
pub mod config;
pub mod error;
pub mod fetch;
pub mod model;
pub mod output;
pub mod processor;
pub mod service;
pub mod sources;
