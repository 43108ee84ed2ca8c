pub mod broker;
pub mod health;
pub mod management;
pub mod metrics;
pub mod mock;
pub mod retry;
