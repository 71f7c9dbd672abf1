// Handlers module - Centralizes all request handlers
pub mod backends;
pub mod events;
pub mod instances;
