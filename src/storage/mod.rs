pub mod artifact_db;
