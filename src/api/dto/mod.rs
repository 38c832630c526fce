pub mod conversation;
pub mod gateway;
pub mod health;
pub mod message;
