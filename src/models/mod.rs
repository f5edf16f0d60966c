pub mod arx;
pub mod audit;
pub mod message;
pub mod summary;
pub mod tenant;
pub mod validation;
