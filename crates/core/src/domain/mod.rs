pub mod approval;
pub mod history;
pub mod purchase;
pub mod rule;
pub mod settings;
