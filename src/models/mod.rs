pub mod api;
pub mod essay;
pub mod job;
pub mod state;
