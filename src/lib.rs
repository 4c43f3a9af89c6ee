pub mod config;
pub mod database;
pub mod error;
pub mod markup;
pub mod models;
pub mod pipeline;
pub mod profiles;
pub mod source;
pub mod sync;
pub mod traits;
