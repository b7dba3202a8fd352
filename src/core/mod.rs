pub mod application;
pub mod controller;
pub mod definition;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod file_path;
pub mod invoker;
pub mod path_bind;
pub mod registry;
pub mod session;
pub mod tools;

pub use application::{ApplicationContext, RouteTarget};
pub use definition::WebappDefinition;
pub use definitions::DefinitionStore;
pub use engine::RoutingEngine;
pub use registry::ApplicationRegistry;
