pub mod campaigns;
pub mod health;
pub mod logs;
pub mod report;
