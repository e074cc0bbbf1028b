//! Service descriptors and restart policy (`spec.md` §4.1).

use std::process::Child;

use color_eyre::eyre::Result;

/// How the supervisor reacts to one of its children exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always restart within the restart budget.
    Permanent,
    /// Restart only if the last exit was non-zero; a clean exit triggers a
    /// whole-process shutdown.
    Transient,
    /// Never restart; the service is forgotten on exit.
    Temporary,
}

/// A function that spawns one instance of a service.
pub type StartFn = Box<dyn Fn() -> Result<Child> + Send>;

/// A supervised service, as passed to [`super::Supervisor::new`].
pub struct ServiceSpec {
    /// Name used in the PID file and in logs (e.g. `"postgres ctl"`).
    pub name: String,
    /// Restart policy applied when this service's child exits.
    pub restart_policy: RestartPolicy,
    /// Spawns one instance of the service.
    pub start_fn: StartFn,
}

impl std::fmt::Debug for ServiceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSpec")
            .field("name", &self.name)
            .field("restart_policy", &self.restart_policy)
            .finish_non_exhaustive()
    }
}
