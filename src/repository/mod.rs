//! Repositories resolve the executor bound to the caller's [`UnitOfWork`](crate::UnitOfWork)
//! before issuing SQL. They never acquire connections or manage transaction
//! boundaries themselves.

pub mod user;

pub use user::{User, UserError, UserRepository};
