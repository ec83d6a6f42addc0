pub mod agents;
pub mod chat;
pub mod health;
pub mod hosts;
pub mod jobs;
pub mod webhooks;
