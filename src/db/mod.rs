pub mod db_pool;
pub mod params;
pub mod source_pool;
