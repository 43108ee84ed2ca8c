pub mod balancer;
pub mod bucket;
pub mod config;
pub mod cycle;
pub mod error;
pub mod groups;
pub mod handlers;
pub mod policy;
pub mod readiness;
