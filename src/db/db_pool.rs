use duckdb::Connection;
use r2d2::{ManageConnection, Pool};

pub struct DuckDbConnectionManager {
    path: String,
}

impl DuckDbConnectionManager {
    pub fn new(path: String) -> Self {
        Self { path }
    }
}

impl ManageConnection for DuckDbConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Connection::open(&self.path)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub fn build_pool(path: &str, size: usize) -> Result<Pool<DuckDbConnectionManager>, r2d2::Error> {
    Pool::builder()
        .max_size(size as u32)
        .build(DuckDbConnectionManager::new(path.to_string()))
}
