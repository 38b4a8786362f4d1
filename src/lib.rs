pub mod datasource;
pub mod db;
pub mod export;
pub mod frame;
pub mod store;
