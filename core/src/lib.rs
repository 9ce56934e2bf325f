pub mod db;
pub mod history_import;
pub mod models;
pub mod period;
pub mod service;
