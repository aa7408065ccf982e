pub mod message_service;
pub mod search;
pub mod sync;
