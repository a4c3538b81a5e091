pub mod build_mode;
pub mod build_worker;
pub mod builder;
pub mod query;
pub mod query_worker;
pub mod repoint;
