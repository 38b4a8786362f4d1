mod connection;
mod query;
mod value;

pub use connection::*;
pub use query::*;
pub use value::*;
