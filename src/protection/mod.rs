//! Request evaluation: rule compilation, client resolution, the stage
//! chain and the backend status observer.

pub mod chain;
pub mod resolver;
pub mod rules;
pub mod stages;
pub mod status;
pub mod url_filter;
