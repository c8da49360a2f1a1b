pub mod commands;
pub mod events;
pub mod generation;
pub mod library;
pub mod models;
