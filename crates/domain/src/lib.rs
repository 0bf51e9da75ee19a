// Gantry - Domain Layer
// Bounded Contexts:
// - shared_kernel: Tipos base, IDs, fases y errores compartidos
// - node: NodeTemplate, AuthConfig, selectores de cabecera
// - node_provider: NodeProvider trait, CommandRunner, HealthStatus

pub mod node;
pub mod node_provider;
pub mod shared_kernel;

#[cfg(test)]
mod tests;

pub use node::*;
pub use node_provider::*;
pub use shared_kernel::*;
