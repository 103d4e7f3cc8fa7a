pub mod converter;
pub mod inference;
pub mod queue;
pub mod schema;
pub mod webhook;
pub mod worker;
