pub mod request;
pub mod threat;
