pub mod gateway;

pub use gateway::IntakeGateway;
