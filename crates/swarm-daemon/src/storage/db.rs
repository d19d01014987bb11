//! Database connection and initialization.

pub use swarm_core::db::DatabaseError;

swarm_core::define_database!(Database, "Supervisor database migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }
}
