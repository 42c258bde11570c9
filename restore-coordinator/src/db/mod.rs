pub mod connection;

pub use connection::{ConnectionPool, DbVersion, PgPool};
