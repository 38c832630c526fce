pub mod conversation;
pub mod event;
pub mod identity;
pub mod message;
