// packages/engine/src/runtime/mod.rs
//! Instance pool runtime
//!
//! This module multiplexes work across several isolated copies of an
//! embedded runtime loaded into one process:
//!
//! - **Instance Pool**: fixed set of instances plus the load balancer
//! - **Load Balancer**: approximate least-used instance selection
//! - **Session**: scoped lease on one instance
//! - **Replicated Object**: snapshot materialized lazily per instance
//! - **Package**: archive of serialized objects and text resources
//! - **Boundary**: translation of runtime errors and panics
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 InstancePool (N)                     │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐            │
//! │  │Instance 0│  │Instance 1│  │Instance 2│  ...       │
//! │  │ private  │  │ private  │  │ private  │            │
//! │  │ heap     │  │ heap     │  │ heap     │            │
//! │  └──────────┘  └──────────┘  └──────────┘            │
//! │        ▲             ▲             ▲                 │
//! │        └─────────────┼─────────────┘                 │
//! │               LoadBalancer (uses per instance)       │
//! │                      │                               │
//! │        Sessions from many host threads               │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod boundary;
pub mod instance;
pub mod instance_pool;
pub mod load_balancer;
pub mod package;
pub mod replicated;
pub mod session;

// Re-export commonly used types
pub use boundary::{guard, shield};
pub use instance::Instance;
pub use instance_pool::{InstancePool, InstancePoolConfig, PoolStats};
pub use load_balancer::LoadBalancer;
pub use package::Package;
pub use replicated::ReplicatedObj;
pub use session::Session;

#[cfg(test)]
pub(crate) mod testing {
    use super::InstancePool;
    use crate::interpreter::{
        InterpreterImpl, Library, LocalInterpreter, LocalRuntime, ModuleDef, NativeResult,
        RuntimeLoader, SessionImpl, Value,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Library with a callable class, a panicking function and a mutable counter
    pub(crate) fn library() -> Library {
        Library::new()
            .with_module(
                ModuleDef::new("demo")
                    .function("scaler", |_, args| {
                        Ok(Value::Object {
                            class: "demo.Scaler".to_string(),
                            state: Box::new(Value::Int(args.int(0)?)),
                        })
                    })
                    .function("boom", |_, _| panic!("native code exploded")),
            )
            .with_module(ModuleDef::new("demo.Scaler").function("__call__", |_, args| {
                let factor = args.receiver_state()?.as_int().unwrap_or(1);
                let x = match args.kwarg("x") {
                    Some(x) => x.as_int().ok_or("x must be int")?,
                    None => args.int(0)?,
                };
                let offset = args.kwarg("offset").and_then(Value::as_int).unwrap_or(0);
                Ok(Value::Int(factor * x + offset))
            }))
            .with_module(ModuleDef::new("counter").attr("count", Value::Int(0)).function(
                "bump",
                |scope, _| {
                    let next = scope.get_attr("counter", "count").and_then(Value::as_int).unwrap_or(0) + 1;
                    scope.set_attr("counter", "count", Value::Int(next))?;
                    Ok(Value::Int(next))
                },
            ))
    }

    pub(crate) fn pool(instances: usize) -> InstancePool {
        InstancePool::new(instances, &LocalRuntime::new(library())).unwrap()
    }

    /// Loader that keeps a handle on every interpreter it creates
    pub(crate) struct TrackingLoader {
        library: Library,
        loaded: Mutex<Vec<Arc<LocalInterpreter>>>,
    }

    impl TrackingLoader {
        pub(crate) fn new(library: Library) -> Self {
            Self {
                library,
                loaded: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn interpreter(&self, ordinal: usize) -> Arc<LocalInterpreter> {
            Arc::clone(&self.loaded.lock()[ordinal])
        }
    }

    struct Tracked(Arc<LocalInterpreter>);

    impl InterpreterImpl for Tracked {
        fn acquire_session(&self) -> NativeResult<Box<dyn SessionImpl>> {
            self.0.acquire_session()
        }
    }

    impl RuntimeLoader for TrackingLoader {
        fn load(&self, ordinal: usize) -> NativeResult<Box<dyn InterpreterImpl>> {
            let interp = Arc::new(LocalInterpreter::new(ordinal, self.library.clone()));
            self.loaded.lock().push(Arc::clone(&interp));
            Ok(Box::new(Tracked(interp)))
        }
    }
}
