pub mod common;
pub mod locked;
pub mod push;
pub mod settings;
pub mod status;
pub mod unlock;
