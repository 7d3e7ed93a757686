pub mod database;
pub mod records;
pub mod registry;
pub mod schema;
pub mod sharing;
