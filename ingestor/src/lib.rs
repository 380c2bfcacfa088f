pub mod alerts;
pub mod batching;
pub mod broadcast;
pub mod changes;
pub mod commands;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod pairing;
pub mod payload;
pub mod registration;
pub mod repository;
pub mod router;
pub mod sweeper;
pub mod topic;
pub mod twin;
pub mod validate;
