pub mod associations;
pub mod db_connect;
pub mod prefilter;
pub mod results;
pub mod schema;
pub mod units;

pub use db_connect::{connect, get_pool_status, PgPool};
