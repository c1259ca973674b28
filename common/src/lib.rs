// Common library for the job-queue coordination layer: queue adapter, job
// tracker, webhooks, subscriptions and scheduler

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod models;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod subscription;
pub mod telemetry;
pub mod tenant;
pub mod tracker;
pub mod webhook;
