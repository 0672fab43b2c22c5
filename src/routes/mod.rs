pub mod alerts;
pub mod auth;
pub mod dashboard;
pub mod error;
pub mod health;
pub mod ingest;
pub mod insights;
pub mod llm;
pub mod logs;
pub mod projects;
