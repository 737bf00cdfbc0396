pub mod health_check;
pub mod session_reaper;
