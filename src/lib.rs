pub mod app;
pub mod config;
pub mod db;
pub mod dna;
pub mod error;
pub mod format;
pub mod fs_util;
pub mod location;
pub mod output;
pub mod query;
pub mod runner;
pub mod sql;
