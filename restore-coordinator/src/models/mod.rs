pub mod backup_config;
pub mod toc;
