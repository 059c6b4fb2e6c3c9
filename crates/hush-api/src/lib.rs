pub mod auth;
pub mod conversations;
pub mod error;
pub mod middleware;
pub mod unmasking;
pub mod validate;
pub mod whispers;

mod convert;
