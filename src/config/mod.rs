pub mod defaults;
pub mod lists;
pub mod settings;
