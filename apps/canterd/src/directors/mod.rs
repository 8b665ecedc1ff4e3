pub mod lobby;
pub mod race;
pub mod ranch;
