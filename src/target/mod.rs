//! Target Resolution Module
//! 
//! Determines the single upstream address an exposure session forwards to.

pub mod inspector;
pub mod resolver;

pub use inspector::{ContainerInspector, DockerCli};
pub use resolver::{ExposureTarget, TargetResolver, TargetSpec};
