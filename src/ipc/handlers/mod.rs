pub mod admin;
pub mod approval;
pub mod auth;
pub mod core;
pub mod dashboard;
pub mod exams;
pub mod fees;
pub mod notifications;
pub mod registration;
