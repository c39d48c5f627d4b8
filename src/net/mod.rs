pub mod frame;
pub mod message;
pub mod misbehavior;
pub mod node;
pub mod peer;
pub mod policy;
pub mod scheduler;
pub mod validation;
