pub mod broadcaster;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod support;
