// Gantry - Infrastructure Layer
// Implementaciones concretas del backend de orquestación y persistencia
// Módulos:
// - providers: Implementaciones de NodeProvider (Kubernetes)
// - persistence: Adaptadores de persistencia (archivo de cluster)
// - command_runner: Ejecución remota por SSH

pub mod command_runner;
pub mod persistence;
pub mod providers;

pub use command_runner::*;
pub use persistence::*;
pub use providers::*;
