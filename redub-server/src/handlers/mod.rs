pub mod admin;
pub mod auth;
pub mod events;
pub mod files;
pub mod invites;
pub mod jobs;
pub mod library;
pub mod uploads;
