pub mod command_runner;
pub mod git_integration;
pub mod pubsub_integration;
pub mod pubsub_response;
pub mod storage_integration;
pub mod unity_integration;
