//! The control protocol: wire codec, connection buffers, handle tables,
//! command dispatch, and event fan-out.
//!
//! [`ControlHub`] is the assembly point: it owns the shared service set,
//! environment store, and event router, and attaches controllers to
//! accepted client streams. The embedding supervisor owns the sockets and
//! the readiness loop.

pub mod buffer;
pub mod codec;
mod conn;
mod dispatch;
pub mod events;
pub mod handle;

use std::rc::Rc;

use crate::config::Config;
use crate::core::{EnvStore, ServiceSet};

use buffer::BufferLimits;
use events::EventRouter;

pub use buffer::OverflowError;
pub use codec::{Command, Handle, Info, Reply};
pub use conn::{CloseReason, ConnStatus, Controller};
pub use events::{EmitMode, SubscriptionFlags};

/// Shared control-plane state: the model, the environment store, and the
/// event router joining them to every open connection.
pub struct ControlHub {
    services: Rc<ServiceSet>,
    env: Rc<EnvStore>,
    router: Rc<EventRouter>,
    limits: BufferLimits,
}

impl ControlHub {
    pub fn new(config: &Config) -> Self {
        let services = Rc::new(ServiceSet::new());
        let env = Rc::new(EnvStore::new());
        let router = Rc::new(EventRouter::new());
        services.add_observer(Rc::downgrade(&router) as std::rc::Weak<dyn crate::core::ModelObserver>);
        env.add_observer(Rc::downgrade(&router) as std::rc::Weak<dyn crate::core::ModelObserver>);
        ControlHub {
            services,
            env,
            router,
            limits: config.buffers,
        }
    }

    pub fn services(&self) -> &Rc<ServiceSet> {
        &self.services
    }

    pub fn env(&self) -> &Rc<EnvStore> {
        &self.env
    }

    pub fn connection_count(&self) -> usize {
        self.router.connection_count()
    }

    /// Wrap an accepted client stream in a connection controller.
    pub fn attach<S>(&self, stream: S) -> Controller<S> {
        Controller::new(
            stream,
            Rc::clone(&self.services),
            Rc::clone(&self.env),
            Rc::clone(&self.router),
            self.limits,
        )
    }

    /// Run deferred model work (restart re-entries).
    pub fn tick(&self) {
        self.services.tick();
    }
}

impl Default for ControlHub {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}
