pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod directory;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod housekeeping;
pub mod model;
pub mod registry;
pub mod validation;
pub mod ws;
