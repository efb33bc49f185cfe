pub mod datafile_handlers;
pub mod health_handlers;
